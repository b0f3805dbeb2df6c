use axum::{
    Form, Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::archiver::Archiver;
use crate::db::{AnalysisStatus, DbFirmwareAnalysis};
use crate::forms::{DeleteFirmwareForm, FirmwareAnalysisForm, StopAnalysisForm};
use crate::middleware::RequireLogin;
use crate::porter::result_read_in;
use crate::{EmbarkError, router::EmbarkState};

const LOG_TAIL_LINES: usize = 20;

/// GET /home/ -> overview counters.
pub async fn home(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
) -> Result<Json<Value>, EmbarkError> {
    let files = state.storage.list_firmware_files().await?.len();
    let analyses = state.storage.count_analyses().await?;
    let running = state.analysis.running_count().await?;
    Ok(Json(json!({
        "firmware_files": files,
        "analyses": analyses,
        "running": running,
    })))
}

/// GET /home/about/
pub async fn about(_auth: RequireLogin) -> Json<Value> {
    Json(json!({
        "name": "EMBArk",
        "description": "firmware security scanning dashboard for EMBA",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /home/upload/{refreshed}/ -> uploaded firmware and accepted archive formats.
pub async fn list_uploads(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(refreshed): Path<i64>,
) -> Result<Json<Value>, EmbarkError> {
    let files = state.storage.list_firmware_files().await?;
    Ok(Json(json!({
        "refreshed": refreshed,
        "files": files,
        "formats": state.archiver.get_supported_formats(),
        "extensions": state.archiver.get_supported_extensions(),
    })))
}

/// POST /home/upload/{refreshed}/ -> creates an analysis and hands it to the runner.
pub async fn start_analysis(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(_refreshed): Path<i64>,
    Json(form): Json<FirmwareAnalysisForm>,
) -> Result<impl IntoResponse, EmbarkError> {
    let firmware = state
        .storage
        .get_firmware_file(form.firmware)
        .await?
        .ok_or_else(|| EmbarkError::NotFound(format!("firmware {}", form.firmware)))?;
    let new = form.validate(&firmware.file_name)?;

    let id = state.storage.create_analysis(new).await?;
    state.analysis.start_analysis(id).await;
    info!(id, firmware = %firmware.file_name, "analysis submitted");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "status": AnalysisStatus::Pending })),
    ))
}

/// POST /home/delete/ -> removes an uploaded firmware file and its record.
pub async fn delete_file(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Form(form): Form<DeleteFirmwareForm>,
) -> Result<Json<Value>, EmbarkError> {
    let id = form.validate()?;
    let file = state
        .storage
        .get_firmware_file(id)
        .await?
        .ok_or_else(|| EmbarkError::NotFound(format!("firmware {id}")))?;

    // the record goes only once the file is gone
    match tokio::fs::remove_file(&file.path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %file.path, "firmware file already gone from disk");
        }
        Err(e) => return Err(e.into()),
    }
    state.storage.delete_firmware_file(id).await?;
    info!(id, file = %file.file_name, "firmware deleted");
    Ok(Json(json!({ "deleted": id })))
}

/// POST /home/upload/{refreshed}/save_file -> stores uploaded firmware.
/// Answers the plain text `File Exists` when a name is already taken.
pub async fn save_file(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(_refreshed): Path<i64>,
    mut multipart: Multipart,
) -> Result<Response, EmbarkError> {
    tokio::fs::create_dir_all(&state.cfg.upload_root).await?;

    let mut saved = Vec::new();
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = sanitize_file_name(field.file_name().unwrap_or_default())?;
        let path = state.cfg.upload_root.join(&file_name);

        if state.storage.find_firmware_file(&file_name).await?.is_some() {
            info!(file = %file_name, "upload rejected, name taken");
            return Ok((StatusCode::OK, "File Exists").into_response());
        }
        let mut out = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                info!(file = %file_name, "upload rejected, file already on disk");
                return Ok((StatusCode::OK, "File Exists").into_response());
            }
            Err(e) => return Err(e.into()),
        };

        let stored = async {
            let size = write_field(&mut field, &mut out).await?;
            let record = state
                .storage
                .insert_firmware_file(&file_name, &path.to_string_lossy())
                .await?;
            Ok::<_, EmbarkError>((size, record))
        }
        .await;
        let (size, record) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                // drop the partial or unrecorded upload
                drop(out);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };
        info!(id = record.id, file = %file_name, size, "firmware uploaded");
        saved.push(json!({
            "id": record.id,
            "file_name": record.file_name,
            "size": size,
            "archive": state.archiver.check_extensions(&file_name),
        }));
    }

    if saved.is_empty() {
        return Err(EmbarkError::Validation("no `file` field in upload".into()));
    }
    Ok(Json(json!({ "saved": saved })).into_response())
}

/// POST /home/stop/ -> kills a running analysis.
pub async fn stop_analysis(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Form(form): Form<StopAnalysisForm>,
) -> Result<Json<Value>, EmbarkError> {
    let id = form.validate()?;
    if !state.analysis.stop_analysis(id).await? {
        return Err(EmbarkError::NotFound(format!("active analysis {id}")));
    }
    Ok(Json(json!({ "stopped": id })))
}

/// POST /home/import/{analysis_id}/ -> re-reads the EMBA CSV logs.
pub async fn import_results(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(analysis_id): Path<i64>,
) -> Result<Json<Value>, EmbarkError> {
    if state.storage.get_analysis(analysis_id).await?.is_none() {
        return Err(EmbarkError::NotFound(format!("analysis {analysis_id}")));
    }
    let result = result_read_in(&state.storage, &state.cfg, analysis_id).await?;
    Ok(Json(json!({ "result": result })))
}

#[derive(Serialize)]
struct AnalysisLog {
    #[serde(flatten)]
    analysis: DbFirmwareAnalysis,
    log_tail: Vec<String>,
}

/// GET /logs/ -> every analysis with the end of its `emba.log`.
pub async fn get_logs(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
) -> Result<Json<Value>, EmbarkError> {
    let mut logs = Vec::new();
    for analysis in state.storage.list_analyses().await? {
        let log_tail = if analysis.path_to_logs.is_empty() {
            Vec::new()
        } else {
            let log_file = std::path::Path::new(&analysis.path_to_logs).join("emba.log");
            match tokio::fs::read_to_string(&log_file).await {
                Ok(text) => tail_lines(&text, LOG_TAIL_LINES),
                Err(e) => {
                    debug!(path = %log_file.display(), error = %e, "no emba.log yet");
                    Vec::new()
                }
            }
        };
        logs.push(AnalysisLog { analysis, log_tail });
    }
    Ok(Json(json!({ "logs": logs })))
}

/// GET /download_zipped/{analyze_id}/ -> the analysis log directory as zip.
pub async fn download_zipped(
    State(state): State<EmbarkState>,
    _auth: RequireLogin,
    Path(analyze_id): Path<i64>,
) -> Result<Response, EmbarkError> {
    if state.storage.get_analysis(analyze_id).await?.is_none() {
        return Err(EmbarkError::NotFound(format!("analysis {analyze_id}")));
    }
    let log_dir = state.cfg.analysis_log_dir(analyze_id);
    if !tokio::fs::try_exists(&log_dir).await? {
        return Err(EmbarkError::NotFound(format!("logs of analysis {analyze_id}")));
    }

    let file_name = format!("{analyze_id}.zip");
    let zip_path = state.cfg.log_root.join(&file_name);
    let zipped = {
        let zip_path = zip_path.clone();
        let log_root = state.cfg.log_root.clone();
        tokio::task::spawn_blocking(move || -> Result<PathBuf, EmbarkError> {
            // concurrent downloads each build their own archive, then swap it in
            let partial = tempfile::Builder::new()
                .prefix(&format!(".{analyze_id}-"))
                .suffix(".zip.part")
                .tempfile_in(&log_root)?;
            Archiver::make_zipfile(partial.path(), &log_dir)?;
            partial.persist(&zip_path).map_err(|e| e.error)?;
            Ok(zip_path)
        })
        .await??
    };
    state
        .storage
        .set_zip_file(analyze_id, &zipped.to_string_lossy())
        .await?;

    let file = tokio::fs::File::open(&zipped).await?;
    let size = file.metadata().await?.len();
    info!(id = analyze_id, size, "serving zipped logs");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn write_field(
    field: &mut axum::extract::multipart::Field<'_>,
    out: &mut tokio::fs::File,
) -> Result<usize, EmbarkError> {
    let mut size = 0usize;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len();
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(size)
}

/// Keep the last path segment and replace anything outside `[A-Za-z0-9._+-]`.
pub fn sanitize_file_name(raw: &str) -> Result<String, EmbarkError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return Err(EmbarkError::Validation(format!("invalid file name `{raw}`")));
    }
    Ok(cleaned)
}

fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("fw-1.0.bin").unwrap(), "fw-1.0.bin");
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\up\\my fw.zip").unwrap(), "my_fw.zip");
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("dir/").is_err());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(text, 10).len(), 4);
        assert!(tail_lines("", 3).is_empty());
    }
}
