use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg: &embark::config::Config = &embark::config::CONFIG;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.database_url,
        log_root = %cfg.log_root.display(),
        upload_root = %cfg.upload_root.display(),
        emba = %cfg.emba_script.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<none>".into()),
        loglevel = %cfg.loglevel,
    );

    let storage = embark::EmbarkStorage::connect(&cfg.database_url).await?;
    let handle = embark::service::analysis_actor::spawn(storage.clone(), cfg.clone()).await?;

    // pick up analyses queued before the last shutdown
    for analysis in storage
        .list_analyses_by_status(&[embark::db::AnalysisStatus::Pending])
        .await?
    {
        handle.start_analysis(analysis.id).await;
    }

    let state = embark::router::EmbarkState::new(storage, handle, cfg.clone());
    let app = embark::router::embark_router(state);

    let listener = TcpListener::bind(cfg.listen_addr.as_str()).await?;
    info!("HTTP server listening on {}", cfg.listen_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
