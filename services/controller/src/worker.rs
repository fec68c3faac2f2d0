//! Controller background worker.
//!
//! Runs one reconcile loop per spec. Loops are independent tokio tasks;
//! nothing is shared between them except the reconciler's per-node and
//! per-key locks. Each loop wakes on:
//! - a store notification for its spec
//! - a collector notification for one of its instances
//! - the periodic tick (safety net for missed notifications and for
//!   changes written by another process)
//! - its own requeue timer when a backed-off action becomes retryable
//!
//! Triggers coalesce: a loop has at most one queued wake-up, and a pass
//! always works from current state, so extra triggers are never lost work.
//!
//! No loop starts before the collector's first relist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rekon_id::ResourceName;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::device::DevicePlugin;
use crate::reconciler::Reconciler;

struct SpecLoop {
    trigger: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Controller worker that drives the per-spec loops.
pub struct ControllerWorker {
    reconciler: Arc<Reconciler>,
    device_plugin: Option<Arc<dyn DevicePlugin>>,
    interval: Duration,
}

impl ControllerWorker {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            device_plugin: None,
            interval,
        }
    }

    /// Refresh node capacities from `plugin` on every tick.
    pub fn with_device_plugin(mut self, plugin: Arc<dyn DevicePlugin>) -> Self {
        self.device_plugin = Some(plugin);
        self
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting controller worker");

        tokio::select! {
            _ = self.reconciler.collector().wait_synced() => {}
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Controller worker shutting down before first relist");
                return;
            }
        }

        let mut store_rx = Some(self.reconciler.store().subscribe());
        let mut observed_rx = Some(self.reconciler.collector().subscribe());
        let mut loops: HashMap<ResourceName, SpecLoop> = HashMap::new();
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut loops, &shutdown).await;
                }
                name = recv(&mut store_rx) => {
                    self.on_notification(name, &mut store_rx, &mut loops, &shutdown).await;
                }
                name = recv(&mut observed_rx) => {
                    self.on_notification(name, &mut observed_rx, &mut loops, &shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
            }
        }

        for (name, spec_loop) in loops {
            drop(spec_loop.trigger);
            if let Err(e) = spec_loop.task.await {
                error!(spec = %name, error = %e, "Reconcile loop panicked");
            }
        }
    }

    async fn tick(
        &self,
        loops: &mut HashMap<ResourceName, SpecLoop>,
        shutdown: &watch::Receiver<bool>,
    ) {
        if let Some(plugin) = &self.device_plugin {
            if let Err(e) = self.reconciler.placement().sync_capacity(plugin.as_ref()).await {
                warn!(error = %e, "Failed to refresh node capacity");
            }
        }

        loops.retain(|_, spec_loop| !spec_loop.task.is_finished());
        self.trigger_all(loops, shutdown).await;
    }

    async fn on_notification(
        &self,
        received: Result<ResourceName, RecvError>,
        rx: &mut Option<broadcast::Receiver<ResourceName>>,
        loops: &mut HashMap<ResourceName, SpecLoop>,
        shutdown: &watch::Receiver<bool>,
    ) {
        match received {
            Ok(name) => self.trigger(loops, name, shutdown),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notifications lagged, triggering every spec");
                self.trigger_all(loops, shutdown).await;
            }
            Err(RecvError::Closed) => {
                debug!("Notification channel closed, relying on periodic ticks");
                *rx = None;
            }
        }
    }

    /// Wake every spec known to the store or the collector.
    async fn trigger_all(
        &self,
        loops: &mut HashMap<ResourceName, SpecLoop>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let mut names: Vec<ResourceName> = match self.reconciler.store().list() {
            Ok(records) => records.into_iter().map(|r| r.spec.name).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list desired state");
                Vec::new()
            }
        };
        names.extend(self.reconciler.collector().spec_names().await);
        names.extend(loops.keys().cloned());
        names.sort();
        names.dedup();

        for name in names {
            self.trigger(loops, name, shutdown);
        }
    }

    /// Wake the loop for `name`, spawning it if needed.
    fn trigger(
        &self,
        loops: &mut HashMap<ResourceName, SpecLoop>,
        name: ResourceName,
        shutdown: &watch::Receiver<bool>,
    ) {
        if let Some(spec_loop) = loops.get(&name) {
            match spec_loop.trigger.try_send(()) {
                // Full: a wake-up is already queued.
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => return,
                Err(mpsc::error::TrySendError::Closed(())) => {
                    loops.remove(&name);
                }
            }
        }

        debug!(spec = %name, "Starting reconcile loop");
        let (trigger, triggers) = mpsc::channel(1);
        let _ = trigger.try_send(());
        let task = tokio::spawn(run_spec_loop(
            Arc::clone(&self.reconciler),
            name.clone(),
            triggers,
            shutdown.clone(),
        ));
        loops.insert(name, SpecLoop { trigger, task });
    }
}

async fn recv(
    rx: &mut Option<broadcast::Receiver<ResourceName>>,
) -> Result<ResourceName, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Reconcile loop of one spec. Exits once the spec is gone.
async fn run_spec_loop(
    reconciler: Arc<Reconciler>,
    name: ResourceName,
    mut triggers: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut requeue_after: Option<Duration> = None;

    loop {
        let requeue = async move {
            match requeue_after {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
            _ = requeue => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        match reconciler.reconcile(&name).await {
            Ok(outcome) if outcome.purged => {
                debug!(spec = %name, "Spec gone, stopping reconcile loop");
                break;
            }
            Ok(outcome) => requeue_after = outcome.requeue_after,
            Err(e) => {
                warn!(spec = %name, error = %e, "Reconcile pass failed");
                requeue_after = Some(Duration::from_secs(1));
            }
        }
    }
}
