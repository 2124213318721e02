use std::{path::Path, sync::Arc};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use uvicoord_core::{Registry, SnapshotSink};

mod api;
mod config;
mod error;
mod launcher;
mod persist;
mod state;
mod sweep_ticker;

use config::ServiceConfig;
use launcher::Launcher;
use persist::FilePersister;
use state::AppState;
use sweep_ticker::SweepTicker;

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let builder =
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "uvicoord.log"));
            builder.with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            builder.init();
            None
        }
    }
}

async fn restore_registry(registry: &Registry, path: &Path) {
    match persist::load_snapshot(path).await {
        Ok(Some(snapshot)) => {
            let report = registry.restore(snapshot).await;
            tracing::info!(
                apps = report.apps,
                instances = report.instances,
                dropped = report.dropped,
                reclaimed = report.reclaimed,
                "registry restored"
            );
        }
        Ok(None) => tracing::info!(path = %path.display(), "no persisted registry; starting empty"),
        Err(err) => {
            // Keep the unreadable file for inspection instead of overwriting it.
            let aside = path.with_extension("json.corrupt");
            let moved = tokio::fs::rename(path, &aside).await.is_ok();
            tracing::warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                moved,
                error = %format!("{err:#}"),
                "persisted registry is unreadable; starting empty"
            );
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing(config::log_dir_from_env().as_deref());

    let config = ServiceConfig::from_env()?;
    tokio::fs::create_dir_all(&config.data_root)
        .await
        .with_context(|| format!("create data root {}", config.data_root.display()))?;

    let snapshot_path = config.snapshot_path();
    let persister = FilePersister::spawn(snapshot_path.clone());
    let registry = Arc::new(Registry::new(config.engine).with_sink(Arc::new(persister.clone())));
    restore_registry(&registry, &snapshot_path).await;

    if let Some(interval) = config.sweep_interval {
        SweepTicker::new(registry.clone(), interval).spawn();
    }

    let state = AppState {
        registry: registry.clone(),
        launcher: Launcher::new(registry.clone(), config.logs_dir()),
        config: Arc::new(config.clone()),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tracing::info!(
        addr = %config.listen,
        data_root = %config.data_root.display(),
        any_range = %config.engine.any_range,
        "uvicoord listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    persister.registry_changed(registry.snapshot())?;
    persister.flush().await;
    Ok(())
}
