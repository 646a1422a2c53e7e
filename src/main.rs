use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use lod_pipeline_worker::config::{CliArgs, Settings};
use lod_pipeline_worker::scheduler::Scheduler;
use lod_pipeline_worker::store::work_store::WorkStore;
use lod_pipeline_worker::store::ObjectStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(log_level_override: Option<&str>) {
    let filter = match log_level_override {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    init_tracing(cli.log_level.as_deref());

    let settings = Settings::load_with_overrides(&cli).context("loading settings")?;
    info!(env = %settings.env, "starting lod-pipeline-worker");

    let store = ObjectStore::new(&settings);
    let work_store = WorkStore::connect(&settings.redis_url)
        .await
        .context("connecting to redis")?;

    let scheduler = Scheduler::new(settings, store, work_store);
    let shutdown = scheduler.shutdown_handle();

    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        tracing::warn!("shutdown signal received, draining");
        shutdown.store(true, Ordering::Relaxed);
    });

    tokio::join!(scheduler.run(), scheduler.run_purge_loop());

    Ok(())
}
