use crate::config::Config;
use crate::db::{AnalysisResult, EmbarkStorage};
use crate::error::EmbarkError;
use crate::porter::csv_reader::{CsvDict, CsvValue, read_csv};
use csv::ReaderBuilder;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

pub const F50_FILE: &str = "f50_base_aggregator.csv";
pub const F20_FILE: &str = "f20_vul_aggregator.csv";
pub const F10_FILE: &str = "f10_license_summary.csv";

/// Column names of `f20_vul_aggregator.csv`; index 2 is the CVE id.
const F20_COLUMNS: [(usize, &str); 11] = [
    (0, "Binary"),
    (1, "Version"),
    (3, "CVSS"),
    (4, "exploit db exploit available"),
    (5, "metasploit module"),
    (6, "trickest PoC"),
    (7, "Routersploit"),
    (8, "local exploit"),
    (9, "remote exploit"),
    (10, "DoS exploit"),
    (11, "known exploited vuln"),
];

static ENTROPY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)").expect("static regex"));

/// Import every known CSV file of one analysis.
/// Returns the last result written, or `None` when nothing was imported.
pub async fn result_read_in(
    storage: &EmbarkStorage,
    cfg: &Config,
    analysis_id: i64,
) -> Result<Option<AnalysisResult>, EmbarkError> {
    debug!(analysis_id, "starting read-in");
    let directory = cfg.csv_log_dir(analysis_id);

    let mut csv_list: Vec<PathBuf> = std::fs::read_dir(&directory)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    csv_list.sort();

    let mut res = None;
    for file in csv_list {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let outcome = if name.ends_with(F50_FILE) {
            f50_csv(storage, &file, analysis_id).await.map(Some)
        } else if name.ends_with(F20_FILE) {
            f20_csv(storage, &file, analysis_id).await.map(Some)
        } else if name.ends_with(F10_FILE) {
            f10_csv(&file, analysis_id).await
        } else {
            debug!(path = %file.display(), "skipping unknown csv file");
            continue;
        };
        match outcome {
            Ok(Some(result)) => {
                debug!(analysis_id, path = %file.display(), "result created or updated");
                res = Some(result);
            }
            Ok(None) => {}
            Err(e) => {
                error!(analysis_id, path = %file.display(), error = %e, "csv import failed");
            }
        }
    }
    info!(analysis_id, imported = res.is_some(), "read-in finished");
    Ok(res)
}

/// Import the base aggregator summary into the analysis' `Result`.
pub async fn f50_csv(
    storage: &EmbarkStorage,
    file_path: &Path,
    analysis_id: i64,
) -> Result<AnalysisResult, EmbarkError> {
    debug!("starting f50 csv import");
    if storage.get_analysis(analysis_id).await?.is_none() {
        return Err(EmbarkError::NotFound(format!("analysis {analysis_id}")));
    }
    let path = file_path.to_path_buf();
    let dict = tokio::task::spawn_blocking(move || read_csv(&path)).await??;
    let result = f50_result(dict, analysis_id)?;
    storage.upsert_result(&result).await
}

/// Map the f50 dictionary onto the result columns.
pub fn f50_result(mut dict: CsvDict, analysis_id: i64) -> Result<AnalysisResult, EmbarkError> {
    dict.remove("FW_path");

    let strcpy_bin = match dict.get("strcpy_bin") {
        Some(v) => serde_json::to_string(v)?,
        None => "{}".to_string(),
    };

    Ok(AnalysisResult {
        id: 0,
        firmware_analysis_id: analysis_id,
        emba_command: text_field(&dict, "emba_command")?,
        architecture_verified: text_field(&dict, "architecture_verified")?,
        os_verified: text_field(&dict, "os_verified")?,
        files: int_field(&dict, "files")?,
        directories: int_field(&dict, "directories")?,
        entropy_value: entropy_field(&dict)?,
        shell_scripts: int_field(&dict, "shell_scripts")?,
        shell_script_vulns: int_field(&dict, "shell_script_vulns")?,
        kernel_modules: int_field(&dict, "kernel_modules")?,
        kernel_modules_lic: int_field(&dict, "kernel_modules_lic")?,
        interesting_files: int_field(&dict, "interesting_files")?,
        post_files: int_field(&dict, "post_files")?,
        canary: int_field(&dict, "canary")?,
        canary_per: int_field(&dict, "canary_per")?,
        relro: int_field(&dict, "relro")?,
        relro_per: int_field(&dict, "relro_per")?,
        no_exec: int_field(&dict, "no_exec")?,
        no_exec_per: int_field(&dict, "no_exec_per")?,
        pie: int_field(&dict, "pie")?,
        pie_per: int_field(&dict, "pie_per")?,
        stripped: int_field(&dict, "stripped")?,
        stripped_per: int_field(&dict, "stripped_per")?,
        bins_checked: int_field(&dict, "bins_checked")?,
        strcpy: int_field(&dict, "strcpy")?,
        strcpy_bin,
        versions_identified: int_field(&dict, "versions_identified")?,
        cve_high: int_field(&dict, "cve_high")?,
        cve_medium: int_field(&dict, "cve_medium")?,
        cve_low: int_field(&dict, "cve_low")?,
        exploits: int_field(&dict, "exploits")?,
        metasploit_modules: int_field(&dict, "metasploit_modules")?,
        certificates: int_field(&dict, "certificates")?,
        certificates_outdated: int_field(&dict, "certificates_outdated")?,
    })
}

fn text_field(dict: &CsvDict, field: &'static str) -> Result<String, EmbarkError> {
    match dict.get(field) {
        None => Ok(String::new()),
        Some(CsvValue::Text(s)) => Ok(s.clone()),
        Some(nested) => Ok(serde_json::to_string(nested)?),
    }
}

fn int_field(dict: &CsvDict, field: &'static str) -> Result<i64, EmbarkError> {
    match dict.get(field) {
        None => Ok(0),
        Some(CsvValue::Text(s)) => s.trim().parse().map_err(|_| EmbarkError::CsvField {
            field,
            value: s.clone(),
        }),
        Some(CsvValue::Map(_)) => Err(EmbarkError::CsvField {
            field,
            value: "<nested>".to_string(),
        }),
    }
}

/// `" 7.55 bits per byte."` -> `7.55`
fn entropy_field(dict: &CsvDict) -> Result<f64, EmbarkError> {
    const FIELD: &str = "entropy_value";
    let Some(value) = dict.get(FIELD) else {
        return Ok(0.0);
    };
    let invalid = || EmbarkError::CsvField {
        field: FIELD,
        value: value.as_text().unwrap_or("<nested>").to_string(),
    };
    let text = value.as_text().ok_or_else(invalid)?;
    let number = ENTROPY_RE.find(text).ok_or_else(invalid)?.as_str();
    number.trim_matches('.').parse().map_err(|_| invalid())
}

/// Import the vulnerability aggregator: one row per CVE.
pub async fn f20_csv(
    storage: &EmbarkStorage,
    file_path: &Path,
    analysis_id: i64,
) -> Result<AnalysisResult, EmbarkError> {
    debug!("starting f20 csv import");
    if storage.get_analysis(analysis_id).await?.is_none() {
        return Err(EmbarkError::NotFound(format!("analysis {analysis_id}")));
    }
    let path = file_path.to_path_buf();
    let vulns = tokio::task::spawn_blocking(move || -> Result<_, EmbarkError> {
        let file = std::fs::File::open(&path)?;
        f20_rows(file)
    })
    .await??;
    debug!(count = vulns.len(), "parsed f20 rows");

    let res = storage.get_or_create_result(analysis_id).await?;
    for (cve, info) in &vulns {
        let linked = async {
            let vuln_id = storage.upsert_vulnerability(cve, info).await?;
            storage.link_vulnerability(res.id, vuln_id).await
        };
        match linked.await {
            Ok(()) => debug!(cve = %cve, result_id = res.id, "adding vulnerability"),
            Err(e) => error!(cve = %cve, error = %e, "error in f20 read-in"),
        }
    }
    debug!("read f20 csv done");
    Ok(res)
}

/// Parse f20 rows into `cve -> info`; the header line is skipped and a
/// later row for the same CVE replaces an earlier one.
pub fn f20_rows<R: Read>(reader: R) -> Result<BTreeMap<String, Value>, EmbarkError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut out = BTreeMap::new();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                error!(line = line + 2, error = %e, "error in f20 read-in");
                continue;
            }
        };
        if record.len() < 12 {
            warn!(
                line = line + 2,
                members = record.len(),
                "error in f20 read-in: row too short"
            );
            continue;
        }
        let info: Map<String, Value> = F20_COLUMNS
            .iter()
            .map(|(idx, name)| (name.to_string(), Value::String(record[*idx].to_string())))
            .collect();
        out.insert(record[2].to_string(), Value::Object(info));
    }
    Ok(out)
}

/// License summary; recognized so it is not reported as unknown, not imported yet.
pub async fn f10_csv(
    _file_path: &Path,
    analysis_id: i64,
) -> Result<Option<AnalysisResult>, EmbarkError> {
    debug!(analysis_id, "starting f10 csv import");
    debug!(analysis_id, "read f10 csv done");
    Ok(None)
}
