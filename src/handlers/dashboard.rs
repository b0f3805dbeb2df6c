use axum::{
    Form, Json,
    extract::{Path, Query, State},
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::db::{AnalysisResult, AnalysisStatus, DbFirmwareAnalysis, DbLabel};
use crate::forms::{LabelForm, LabelSelectForm, TimeForm};
use crate::middleware::RequireLogin;
use crate::{EmbarkError, router::EmbarkState};

/// GET /home/serviceDashboard/ -> analyses that are queued or running.
pub async fn service_dashboard(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
) -> Result<Json<Value>, EmbarkError> {
    let active = state
        .storage
        .list_analyses_by_status(&[AnalysisStatus::Pending, AnalysisStatus::Running])
        .await?;
    let running = state.analysis.running_count().await?;
    Ok(Json(json!({ "running": running, "analyses": active })))
}

/// Totals and averages across the results of finished analyses.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct MainDashboard {
    pub analyses: usize,
    pub files: i64,
    pub directories: i64,
    pub bins_checked: i64,
    pub cve_high: i64,
    pub cve_medium: i64,
    pub cve_low: i64,
    pub exploits: i64,
    pub metasploit_modules: i64,
    pub certificates_outdated: i64,
    pub avg_entropy: f64,
    pub avg_canary_per: f64,
    pub avg_relro_per: f64,
    pub avg_no_exec_per: f64,
    pub avg_pie_per: f64,
    pub avg_stripped_per: f64,
    pub architectures: BTreeMap<String, usize>,
    pub operating_systems: BTreeMap<String, usize>,
}

pub fn aggregate(results: &[AnalysisResult]) -> MainDashboard {
    let mut dash = MainDashboard {
        analyses: results.len(),
        ..MainDashboard::default()
    };
    if results.is_empty() {
        return dash;
    }

    let avg = |f: fn(&AnalysisResult) -> f64| results.iter().map(f).sum::<f64>() / results.len() as f64;
    dash.avg_entropy = avg(|r| r.entropy_value);
    dash.avg_canary_per = avg(|r| r.canary_per as f64);
    dash.avg_relro_per = avg(|r| r.relro_per as f64);
    dash.avg_no_exec_per = avg(|r| r.no_exec_per as f64);
    dash.avg_pie_per = avg(|r| r.pie_per as f64);
    dash.avg_stripped_per = avg(|r| r.stripped_per as f64);

    for r in results {
        // counts come straight from EMBA's CSV output
        dash.files = dash.files.saturating_add(r.files);
        dash.directories = dash.directories.saturating_add(r.directories);
        dash.bins_checked = dash.bins_checked.saturating_add(r.bins_checked);
        dash.cve_high = dash.cve_high.saturating_add(r.cve_high);
        dash.cve_medium = dash.cve_medium.saturating_add(r.cve_medium);
        dash.cve_low = dash.cve_low.saturating_add(r.cve_low);
        dash.exploits = dash.exploits.saturating_add(r.exploits);
        dash.metasploit_modules = dash.metasploit_modules.saturating_add(r.metasploit_modules);
        dash.certificates_outdated = dash
            .certificates_outdated
            .saturating_add(r.certificates_outdated);
        if !r.architecture_verified.is_empty() {
            *dash
                .architectures
                .entry(r.architecture_verified.clone())
                .or_default() += 1;
        }
        if !r.os_verified.is_empty() {
            *dash
                .operating_systems
                .entry(r.os_verified.clone())
                .or_default() += 1;
        }
    }
    dash
}

/// GET /home/mainDashboard/
pub async fn main_dashboard(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
) -> Result<Json<MainDashboard>, EmbarkError> {
    let finished: Vec<i64> = state
        .storage
        .list_analyses_by_status(&[AnalysisStatus::Finished])
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let results: Vec<AnalysisResult> = state
        .storage
        .list_results()
        .await?
        .into_iter()
        .filter(|r| finished.contains(&r.firmware_analysis_id))
        .collect();
    Ok(Json(aggregate(&results)))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    /// Only analyses started on or after this day.
    pub date: Option<String>,
}

#[derive(Serialize)]
struct ReportEntry {
    #[serde(flatten)]
    analysis: DbFirmwareAnalysis,
    labels: Vec<DbLabel>,
    result: Option<AnalysisResult>,
}

/// GET /home/reportDashboard/?date=YYYY-MM-DD
pub async fn report_dashboard(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Query(query): Query<ReportQuery>,
) -> Result<Json<Value>, EmbarkError> {
    let since = query
        .date
        .map(|date| TimeForm { date }.validate())
        .transpose()?
        .map(|day| day.and_time(NaiveTime::MIN).and_utc());

    let mut reports = Vec::new();
    for analysis in state.storage.list_analyses().await? {
        if since.is_some_and(|since| analysis.start_date < since) {
            continue;
        }
        let labels = state.storage.labels_for(analysis.id).await?;
        let result = state.storage.result_for_analysis(analysis.id).await?;
        reports.push(ReportEntry {
            analysis,
            labels,
            result,
        });
    }
    Ok(Json(json!({ "reports": reports })))
}

/// GET /home/result/{analysis_id}/ -> summary with linked vulnerabilities.
pub async fn result_detail(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(analysis_id): Path<i64>,
) -> Result<Json<Value>, EmbarkError> {
    let result = state
        .storage
        .result_for_analysis(analysis_id)
        .await?
        .ok_or_else(|| EmbarkError::NotFound(format!("result of analysis {analysis_id}")))?;

    let mut vulnerabilities = Vec::new();
    for vuln in state.storage.vulnerabilities_for_result(result.id).await? {
        let info: Value = serde_json::from_str(&vuln.info)?;
        vulnerabilities.push(json!({ "cve": vuln.cve, "info": info }));
    }
    let strcpy_bin: Value = serde_json::from_str(&result.strcpy_bin)?;

    Ok(Json(json!({
        "result": result,
        "strcpy_bin": strcpy_bin,
        "vulnerabilities": vulnerabilities,
    })))
}

/// POST /home/label/ -> creates (or returns) a label.
pub async fn create_label(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Form(form): Form<LabelForm>,
) -> Result<Json<DbLabel>, EmbarkError> {
    let name = form.validate()?;
    Ok(Json(state.storage.upsert_label(&name).await?))
}

/// POST /home/label/{analysis_id}/ -> attaches a label to an analysis.
pub async fn add_label(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(analysis_id): Path<i64>,
    Form(form): Form<LabelSelectForm>,
) -> Result<Json<Vec<DbLabel>>, EmbarkError> {
    let label_id = form.validate()?;
    if state.storage.get_analysis(analysis_id).await?.is_none() {
        return Err(EmbarkError::NotFound(format!("analysis {analysis_id}")));
    }
    if state.storage.get_label(label_id).await?.is_none() {
        return Err(EmbarkError::NotFound(format!("label {label_id}")));
    }
    state.storage.add_label(analysis_id, label_id).await?;
    Ok(Json(state.storage.labels_for(analysis_id).await?))
}
