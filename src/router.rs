use crate::archiver::Archiver;
use crate::config::Config;
use crate::db::EmbarkStorage;
use crate::handlers::{auth, dashboard, uploader};
use crate::service::AnalysisHandle;
use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
};
use axum_extra::extract::cookie::Key;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct EmbarkState {
    pub storage: EmbarkStorage,
    pub analysis: AnalysisHandle,
    pub archiver: Arc<Archiver>,
    pub cfg: Arc<Config>,
    pub embark_key: Arc<str>,
    /// Login attempts per client address.
    pub login_limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
    cookie_key: Key,
}

impl EmbarkState {
    pub fn new(storage: EmbarkStorage, analysis: AnalysisHandle, cfg: Config) -> Self {
        let cookie_key = match Key::try_from(cfg.cookie_secret.as_bytes()) {
            Ok(key) => key,
            Err(_) => {
                warn!("cookie_secret shorter than 64 bytes; sessions will not survive a restart");
                Key::generate()
            }
        };
        if cfg.embark_key.is_empty() {
            warn!("embark_key is empty; every login and key check will be rejected");
        }
        let per_minute = NonZeroU32::new(cfg.login_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            storage,
            analysis,
            archiver: Arc::new(Archiver::new()),
            embark_key: Arc::from(cfg.embark_key.as_str()),
            login_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            cfg: Arc::new(cfg),
            cookie_key,
        }
    }
}

impl FromRef<EmbarkState> for Key {
    fn from_ref(state: &EmbarkState) -> Self {
        state.cookie_key.clone()
    }
}

pub fn embark_router(state: EmbarkState) -> Router {
    let body_limit = state.cfg.body_limit();
    let login_url = state.cfg.login_url.clone();

    let home = Router::new()
        .route("/home/", get(uploader::home))
        .route("/home/about/", get(uploader::about))
        .route(
            "/home/upload/{refreshed}/",
            get(uploader::list_uploads).post(uploader::start_analysis),
        )
        .route("/home/delete/", post(uploader::delete_file))
        .route("/home/stop/", post(uploader::stop_analysis))
        .route("/home/import/{analysis_id}/", post(uploader::import_results))
        .route("/logs/", get(uploader::get_logs))
        .route("/download_zipped/{analyze_id}/", get(uploader::download_zipped))
        .route("/home/serviceDashboard/", get(dashboard::service_dashboard))
        .route("/home/mainDashboard/", get(dashboard::main_dashboard))
        .route("/home/reportDashboard/", get(dashboard::report_dashboard))
        .route("/home/result/{analysis_id}/", get(dashboard::result_detail))
        .route("/home/label/", post(dashboard::create_label))
        .route("/home/label/{analysis_id}/", post(dashboard::add_label));

    let upload = Router::new()
        .route(
            "/home/upload/{refreshed}/save_file",
            post(uploader::save_file),
        )
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route(&login_url, post(auth::login))
        .route("/logout/", get(auth::logout))
        .merge(home)
        .merge(upload)
        .with_state(state)
}
