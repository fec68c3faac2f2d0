//! rekon controller daemon.
//!
//! Keeps the instances of every stored spec converged:
//!
//! - **Store**: SQLite file shared with `rekonctl`, which writes specs
//! - **Collector**: tracks instance phases from runtime events and relists
//! - **Worker**: one reconcile loop per spec, woken by changes and ticks
//! - **Runtime**: abstracts instance lifecycle (mock for now)

use std::sync::Arc;

use anyhow::{Context, Result};
use rekon_controller::collector::ObservedStateCollector;
use rekon_controller::config::Config;
use rekon_controller::device::{DevicePlugin, StaticDevicePlugin};
use rekon_controller::placement::Placement;
use rekon_controller::reconciler::{Reconciler, ReconcilerConfig};
use rekon_controller::runtime::MockRuntime;
use rekon_controller::store::SqliteStore;
use rekon_controller::volumes::{LocalHostPaths, VolumeBinder};
use rekon_controller::worker::ControllerWorker;
use rekon_reconcile::{BackoffPolicy, RollingStrategy};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        store_path = %config.store_path.display(),
        nodes = config.nodes.len(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        relist_interval_secs = config.relist_interval.as_secs(),
        "Starting rekon controller"
    );

    if let Some(parent) = config.store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteStore::open(&config.store_path).context("failed to open desired state store")?,
    );

    // Create the runtime (mock for now)
    let runtime = Arc::new(MockRuntime::new());

    let devices: Arc<dyn DevicePlugin> = Arc::new(StaticDevicePlugin::new(config.nodes.clone()));
    let placement = Arc::new(Placement::new());
    placement
        .sync_capacity(devices.as_ref())
        .await
        .context("failed to load node inventory")?;

    let mut volumes = VolumeBinder::new(Arc::new(LocalHostPaths));
    if let Some(root) = &config.node_root {
        volumes = volumes.with_node_roots(root);
    }

    let collector = Arc::new(ObservedStateCollector::new(
        runtime.clone(),
        config.relist_interval,
    ));

    let reconciler = Arc::new(Reconciler::new(
        store,
        Arc::clone(&collector),
        placement,
        volumes,
        runtime,
        ReconcilerConfig {
            backoff: BackoffPolicy {
                base: config.backoff_base,
                max: config.backoff_max,
                ..BackoffPolicy::default()
            },
            strategy: RollingStrategy::default(),
        },
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector_handle = tokio::spawn(Arc::clone(&collector).run(shutdown_rx.clone()));

    let worker = ControllerWorker::new(reconciler, config.reconcile_interval)
        .with_device_plugin(devices);
    let mut worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller worker panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !worker_handle.is_finished() {
        if let Err(e) = worker_handle.await {
            error!(error = %e, "Controller worker panicked");
        }
    }
    if let Err(e) = collector_handle.await {
        error!(error = %e, "Collector panicked");
    }

    info!("Controller shutdown complete");
    Ok(())
}
