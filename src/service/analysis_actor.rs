use crate::archiver::Archiver;
use crate::config::Config;
use crate::db::{AnalysisStatus, DbFirmwareAnalysis, EmbarkStorage};
use crate::error::EmbarkError;
use crate::porter::result_read_in;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub type AnalysisId = i64;

/// Messages handled by the analysis actor.
#[derive(Debug)]
pub enum AnalysisActorMessage {
    /// Launch EMBA for a pending analysis.
    StartAnalysis(AnalysisId),
    /// Kill a running analysis (or cancel a pending one). Replies whether it was stopped.
    StopAnalysis(AnalysisId, RpcReplyPort<bool>),
    /// Number of EMBA processes currently alive.
    RunningCount(RpcReplyPort<usize>),

    // Internal messages (sent by the actor itself)
    /// The EMBA child exited; import results on success.
    ProcessExited { id: AnalysisId, success: bool },
}

/// Handle for interacting with the analysis actor.
#[derive(Clone)]
pub struct AnalysisHandle {
    actor: ActorRef<AnalysisActorMessage>,
}

impl AnalysisHandle {
    pub async fn start_analysis(&self, id: AnalysisId) {
        let _ = ractor::cast!(self.actor, AnalysisActorMessage::StartAnalysis(id));
    }

    pub async fn stop_analysis(&self, id: AnalysisId) -> Result<bool, EmbarkError> {
        ractor::call!(self.actor, AnalysisActorMessage::StopAnalysis, id)
            .map_err(|e| EmbarkError::RactorError(format!("StopAnalysis RPC failed: {e}")))
    }

    pub async fn running_count(&self) -> Result<usize, EmbarkError> {
        ractor::call!(self.actor, AnalysisActorMessage::RunningCount)
            .map_err(|e| EmbarkError::RactorError(format!("RunningCount RPC failed: {e}")))
    }
}

struct AnalysisActorState {
    storage: EmbarkStorage,
    cfg: Config,
    /// Kill switches of the live EMBA children.
    running: HashMap<AnalysisId, oneshot::Sender<()>>,
}

struct AnalysisActor;

#[ractor::async_trait]
impl Actor for AnalysisActor {
    type Msg = AnalysisActorMessage;
    type State = AnalysisActorState;
    type Arguments = (EmbarkStorage, Config);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        arguments: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (storage, cfg) = arguments;
        // processes from a previous server run are gone
        let stale = storage
            .list_analyses_by_status(&[AnalysisStatus::Running])
            .await
            .map_err(|e| ActorProcessingErr::from(format!("DB load running analyses failed: {e}")))?;
        for analysis in &stale {
            warn!(id = analysis.id, "analysis was running at shutdown; marking failed");
            if let Err(e) = storage.set_status(analysis.id, AnalysisStatus::Failed).await {
                warn!(id = analysis.id, error = %e, "failed to reset stale analysis");
            }
        }

        info!(
            emba = %cfg.emba_script.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<none>".into()),
            "AnalysisActor started"
        );
        Ok(AnalysisActorState {
            storage,
            cfg,
            running: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AnalysisActorMessage::StartAnalysis(id) => {
                if let Err(e) = self.handle_start(state, &myself, id).await {
                    error!(id, error = %e, "failed to start analysis");
                    if let Err(db_err) = state.storage.set_status(id, AnalysisStatus::Failed).await {
                        warn!(id, error = %db_err, "DB set_status(failed) failed");
                    }
                }
            }
            AnalysisActorMessage::StopAnalysis(id, rp) => {
                let stopped = self.handle_stop(state, id).await;
                let _ = rp.send(stopped);
            }
            AnalysisActorMessage::RunningCount(rp) => {
                let _ = rp.send(state.running.len());
            }
            AnalysisActorMessage::ProcessExited { id, success } => {
                if state.running.remove(&id).is_none() {
                    debug!(id, "exit of a stopped analysis; ignoring");
                    return Ok(());
                }
                self.handle_exited(state, id, success);
            }
        }
        Ok(())
    }
}

impl AnalysisActor {
    async fn handle_start(
        &self,
        state: &mut AnalysisActorState,
        myself: &ActorRef<AnalysisActorMessage>,
        id: AnalysisId,
    ) -> Result<(), EmbarkError> {
        if state.running.contains_key(&id) {
            debug!(id, "analysis already running; skip duplicate start");
            return Ok(());
        }
        let analysis = state
            .storage
            .get_analysis(id)
            .await?
            .ok_or_else(|| EmbarkError::NotFound(format!("analysis {id}")))?;
        if analysis.status != AnalysisStatus::Pending {
            debug!(id, status = %analysis.status, "analysis is not pending; skip start");
            return Ok(());
        }

        let Some(script) = state.cfg.emba_script.clone() else {
            warn!(id, "no EMBA script configured; analysis stays pending");
            return Ok(());
        };

        let firmware_id = analysis
            .firmware_id
            .ok_or_else(|| EmbarkError::NotFound(format!("firmware of analysis {id}")))?;
        let firmware = state
            .storage
            .get_firmware_file(firmware_id)
            .await?
            .ok_or_else(|| EmbarkError::NotFound(format!("firmware {firmware_id}")))?;

        let active_dir = state.cfg.active_root.join(id.to_string());
        let src = PathBuf::from(&firmware.path);
        let firmware_path = tokio::task::spawn_blocking(move || Archiver::copy(&src, &active_dir))
            .await?
            .ok_or_else(|| EmbarkError::NotFound(format!("firmware file {}", firmware.path)))?;

        let analysis_dir = state.cfg.analysis_log_dir(id);
        let log_dir = analysis_dir.join("emba_logs");
        tokio::fs::create_dir_all(&analysis_dir).await?;
        state
            .storage
            .set_path_to_logs(id, &log_dir.to_string_lossy())
            .await?;

        let args = emba_args(&firmware_path, &log_dir, &analysis);
        let run_log = std::fs::File::create(analysis_dir.join("emba_run.log"))?;
        let mut child = Command::new(&script)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(run_log.try_clone()?)
            .stderr(run_log)
            .kill_on_drop(true)
            .spawn()?;

        state.storage.set_status(id, AnalysisStatus::Running).await?;
        let (kill_tx, kill_rx) = oneshot::channel();
        state.running.insert(id, kill_tx);
        info!(id, script = %script.display(), ?args, "EMBA started");

        let me = myself.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let success = match exited {
                Some(Ok(status)) => {
                    info!(id, %status, "EMBA exited");
                    status.success()
                }
                Some(Err(e)) => {
                    error!(id, error = %e, "waiting for EMBA failed");
                    false
                }
                None => {
                    if let Err(e) = child.kill().await {
                        warn!(id, error = %e, "failed to kill EMBA");
                    }
                    false
                }
            };
            let _ = ractor::cast!(me, AnalysisActorMessage::ProcessExited { id, success });
        });
        Ok(())
    }

    async fn handle_stop(&self, state: &mut AnalysisActorState, id: AnalysisId) -> bool {
        let was_running = match state.running.remove(&id) {
            Some(kill) => {
                let _ = kill.send(());
                true
            }
            None => false,
        };
        let pending = matches!(
            state.storage.get_analysis(id).await,
            Ok(Some(DbFirmwareAnalysis {
                status: AnalysisStatus::Pending,
                ..
            }))
        );
        if !was_running && !pending {
            return false;
        }
        if let Err(e) = state.storage.set_status(id, AnalysisStatus::Stopped).await {
            warn!(id, error = %e, "DB set_status(stopped) failed");
        }
        info!(id, was_running, "analysis stopped");
        true
    }

    /// The import can take long on big f20 files, so it runs off the mailbox.
    fn handle_exited(&self, state: &AnalysisActorState, id: AnalysisId, success: bool) {
        let storage = state.storage.clone();
        let cfg = state.cfg.clone();
        tokio::spawn(async move {
            finish_analysis(&storage, &cfg, id, success).await;
        });
    }
}

/// Import the results of an exited run and stamp its final status.
pub async fn finish_analysis(
    storage: &EmbarkStorage,
    cfg: &Config,
    id: AnalysisId,
    success: bool,
) -> AnalysisStatus {
    let status = if success {
        match result_read_in(storage, cfg, id).await {
            Ok(res) => {
                info!(id, imported = res.is_some(), "EMBA results read in");
                AnalysisStatus::Finished
            }
            Err(e) => {
                error!(id, error = %e, "EMBA results could not be read in");
                AnalysisStatus::Failed
            }
        }
    } else {
        AnalysisStatus::Failed
    };
    if let Err(e) = storage.set_status(id, status).await {
        warn!(id, error = %e, "DB set_status after exit failed");
    }
    status
}

/// Command line arguments for one EMBA run.
pub fn emba_args(firmware: &Path, log_dir: &Path, analysis: &DbFirmwareAnalysis) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-f".into(),
        firmware.as_os_str().to_owned(),
        "-l".into(),
        log_dir.as_os_str().to_owned(),
    ];
    if let Some(arch) = &analysis.firmware_architecture {
        args.push("-a".into());
        args.push(arch.into());
    }
    if analysis.user_emulation_test {
        args.push("-E".into());
    }
    if analysis.system_emulation_test {
        args.push("-Q".into());
    }
    for module in &analysis.scan_modules {
        args.push("-m".into());
        args.push(module.into());
    }
    args
}

/// Spawn the analysis actor and return a handle.
pub async fn spawn(storage: EmbarkStorage, cfg: Config) -> Result<AnalysisHandle, EmbarkError> {
    let (actor, _jh) = Actor::spawn(None, AnalysisActor, (storage, cfg))
        .await
        .map_err(|e| EmbarkError::RactorError(format!("failed to spawn AnalysisActor: {e}")))?;
    Ok(AnalysisHandle { actor })
}
