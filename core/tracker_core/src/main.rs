use std::sync::Arc;

use clap::Parser;
use tracing::info;

use tracker_core::{
    api::{self, AppState},
    buffer::LocalBuffer,
    category::Categorizer,
    clock::SystemClock,
    config::{Args, TrackerConfig},
    controller::Controller,
    device::load_or_create_device_id,
    store::{KvStore, SqliteStore},
    sync::{HttpCollector, SyncEngine},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracker_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = TrackerConfig::from_args(&args)?;

    if let Some(parent) = config.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&config.db)?);
    let device_id = load_or_create_device_id(store.as_ref()).await?;
    let buffer = LocalBuffer::load(store.clone(), config.buffer_cap).await;
    let categorizer = Categorizer::load(store.clone()).await;
    info!("{} sessions waiting to sync", buffer.size().await);

    let collector = Arc::new(HttpCollector::new(
        &config.collector_url,
        config.request_timeout,
    )?);
    let sync = Arc::new(SyncEngine::new(
        buffer.clone(),
        store.clone(),
        collector,
        config.sync_threshold,
        config.sync_interval,
    ));

    {
        let sync = sync.clone();
        tokio::spawn(async move { sync.register_device().await });
    }
    let sync_loop = tokio::spawn(sync.clone().run());

    let controller = Controller::new(
        device_id,
        Arc::new(SystemClock),
        categorizer,
        buffer,
        Some(sync.clone()),
    );
    let (handle, controller_task) = controller.spawn();

    let app = api::router(AppState {
        controller: handle,
        sync: Some(sync.clone()),
    });

    info!("Tracker listening on http://{}", config.listen);
    info!("DB: {}", config.db.display());
    info!("Collector: {}", config.collector_url);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and with it the last controller handle) is gone; the controller
    // drains its queue and records the open session before exiting.
    controller_task.await?;
    sync_loop.abort();
    let outcome = sync.flush().await;
    info!("final sync: {outcome:?}");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
