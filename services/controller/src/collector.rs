//! Observed state collector.
//!
//! Maintains the controller's view of every instance, keyed by instance id.
//! Two inputs feed it:
//! - runtime events, applied as they arrive
//! - periodic relists, which rebuild the view from the runtime's
//!   authoritative list and repair anything a dropped event left stale
//!
//! Readers always get a consistent snapshot: entries are cloned out under
//! the read lock and never observed half-updated.
//!
//! Entry lifecycle:
//! - `record_pending` adds a Pending entry without a handle before the
//!   runtime is asked to start it; relists keep such entries
//! - an entry with a handle that the runtime no longer lists becomes
//!   Terminated
//! - Terminated entries are dropped by the following relist, so the
//!   transition stays observable for one relist interval
//!
//! Until the first relist succeeds the view is incomplete: instances that
//! survived a controller restart are not in it yet. `is_synced` reports
//! whether that relist has happened.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rekon_id::{InstanceId, ResourceName};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::ControllerResult;
use crate::model::{Instance, InstanceHandle, InstancePhase, InstanceSpec};
use crate::runtime::{Runtime, RuntimeEvent, RuntimeInstance};

/// Capacity of the change notification channel.
const NOTIFY_CAPACITY: usize = 1024;

/// Phase ordering used to keep event application monotonic.
fn phase_rank(phase: InstancePhase) -> u8 {
    match phase {
        InstancePhase::Pending => 0,
        InstancePhase::Running => 1,
        InstancePhase::Failed => 2,
        InstancePhase::Terminated => 3,
    }
}

fn observed(unit: &RuntimeInstance) -> Instance {
    let mut instance = Instance::requested(&unit.spec);
    instance.phase = unit.phase;
    instance.handle = Some(unit.handle.clone());
    instance
}

/// Summary of one relist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelistStats {
    pub listed: usize,
    pub added: usize,
    pub updated: usize,
    pub lost: usize,
    pub dropped: usize,
}

/// Observed state collector.
pub struct ObservedStateCollector {
    runtime: Arc<dyn Runtime>,
    instances: RwLock<BTreeMap<InstanceId, Instance>>,
    seq: AtomicU64,
    runtime_available: AtomicBool,
    synced: watch::Sender<bool>,
    notify: broadcast::Sender<ResourceName>,
    relist_interval: Duration,
}

impl ObservedStateCollector {
    pub fn new(runtime: Arc<dyn Runtime>, relist_interval: Duration) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (synced, _) = watch::channel(false);
        Self {
            runtime,
            instances: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            runtime_available: AtomicBool::new(true),
            synced,
            notify,
            relist_interval,
        }
    }

    /// Snapshot of the instances belonging to a spec, oldest first.
    pub async fn list(&self, spec_name: &ResourceName) -> Vec<Instance> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| &i.spec_name == spec_name)
            .cloned()
            .collect();
        instances.sort_by_key(Instance::creation_key);
        instances
    }

    /// Snapshot of every known instance.
    pub async fn list_all(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.read().await.get(id).cloned()
    }

    /// Names of every spec with at least one observed instance.
    pub async fn spec_names(&self) -> BTreeSet<ResourceName> {
        self.instances
            .read()
            .await
            .values()
            .map(|i| i.spec_name.clone())
            .collect()
    }

    /// Next creation sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Subscribe to change notifications (the name of each affected spec).
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceName> {
        self.notify.subscribe()
    }

    /// False after the runtime could not be reached; cleared by the next
    /// successful relist.
    pub fn runtime_available(&self) -> bool {
        self.runtime_available.load(Ordering::SeqCst)
    }

    /// True once a relist has succeeded.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the first successful relist.
    pub async fn wait_synced(&self) {
        let mut synced = self.synced.subscribe();
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Record that the runtime could not be reached.
    pub fn mark_runtime_unavailable(&self, reason: &str) {
        if self.runtime_available.swap(false, Ordering::SeqCst) {
            warn!(reason, "Runtime unavailable, pausing reconciliation");
        }
    }

    fn publish(&self, spec_name: &ResourceName) {
        let _ = self.notify.send(spec_name.clone());
    }

    // =========================================================================
    // Writes from the reconciler
    // =========================================================================

    /// Record an instance about to be started.
    pub async fn record_pending(&self, spec: &InstanceSpec) {
        self.instances
            .write()
            .await
            .insert(spec.instance_id, Instance::requested(spec));
    }

    /// Attach the runtime handle once a start was accepted.
    ///
    /// Returns false if the entry is gone or already final.
    pub async fn set_handle(&self, handle: InstanceHandle) -> bool {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&handle.instance_id) else {
            return false;
        };
        if instance.phase.is_final() {
            return false;
        }
        instance.handle = Some(handle);
        true
    }

    /// Mark an instance failed. Ignored for terminated instances.
    pub async fn mark_failed(&self, id: &InstanceId, message: impl Into<String>) -> bool {
        self.update(id, |instance| {
            if instance.phase.is_final() {
                return false;
            }
            instance.phase = InstancePhase::Failed;
            instance.message = Some(message.into());
            true
        })
        .await
    }

    /// Flag an instance as selected for termination.
    pub async fn mark_terminating(&self, id: &InstanceId) -> bool {
        self.update(id, |instance| {
            let changed = !instance.terminating;
            instance.terminating = true;
            changed
        })
        .await
    }

    /// Record that an instance is gone.
    pub async fn mark_terminated(&self, id: &InstanceId) -> bool {
        self.update(id, |instance| {
            if instance.phase.is_final() {
                return false;
            }
            instance.phase = InstancePhase::Terminated;
            true
        })
        .await
    }

    async fn update<F>(&self, id: &InstanceId, f: F) -> bool
    where
        F: FnOnce(&mut Instance) -> bool,
    {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(id) else {
            return false;
        };
        let changed = f(instance);
        let spec_name = instance.spec_name.clone();
        drop(instances);

        if changed {
            self.publish(&spec_name);
        }
        changed
    }

    // =========================================================================
    // Runtime inputs
    // =========================================================================

    /// Apply one runtime event.
    ///
    /// Idempotent: replaying an event, or receiving one for an unknown or
    /// terminated instance, changes nothing. Phases only move forward.
    pub async fn apply_event(&self, event: &RuntimeEvent) -> bool {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&event.instance_id) else {
            debug!(instance_id = %event.instance_id, phase = %event.phase, "Event for unknown instance");
            return false;
        };

        if phase_rank(event.phase) <= phase_rank(instance.phase) {
            return false;
        }

        debug!(
            instance_id = %event.instance_id,
            spec = %instance.spec_name,
            from = %instance.phase,
            to = %event.phase,
            "Instance phase changed"
        );
        instance.phase = event.phase;
        if event.message.is_some() {
            instance.message = event.message.clone();
        }
        let spec_name = instance.spec_name.clone();
        drop(instances);

        self.publish(&spec_name);
        true
    }

    /// Rebuild the view from the runtime's authoritative list.
    #[instrument(skip(self))]
    pub async fn relist(&self) -> ControllerResult<RelistStats> {
        // Held across the list call so a start completing concurrently cannot
        // attach a handle the list has not seen yet.
        let mut instances = self.instances.write().await;

        let units = match self.runtime.list().await {
            Ok(units) => units,
            Err(e) => {
                drop(instances);
                let err = e.into_start_error();
                self.mark_runtime_unavailable(&err.to_string());
                return Err(err);
            }
        };

        let mut stats = RelistStats {
            listed: units.len(),
            ..RelistStats::default()
        };
        let mut changed = BTreeSet::new();
        let mut listed = BTreeSet::new();
        let mut max_seq = None;

        for unit in &units {
            let id = unit.spec.instance_id;
            listed.insert(id);
            max_seq = max_seq.max(Some(unit.spec.seq));

            match instances.get_mut(&id) {
                Some(existing) => {
                    let terminating = existing.terminating;
                    let message = existing.message.clone();
                    let mut fresh = observed(unit);
                    fresh.terminating = terminating;
                    fresh.message = message;
                    if *existing != fresh {
                        stats.updated += 1;
                        changed.insert(fresh.spec_name.clone());
                    }
                    *existing = fresh;
                }
                None => {
                    stats.added += 1;
                    let fresh = observed(unit);
                    changed.insert(fresh.spec_name.clone());
                    instances.insert(id, fresh);
                }
            }
        }

        instances.retain(|id, instance| {
            if listed.contains(id) {
                return true;
            }
            match (instance.phase, &instance.handle) {
                (InstancePhase::Terminated, _) => {
                    stats.dropped += 1;
                    changed.insert(instance.spec_name.clone());
                    false
                }
                // Start requested or failed before the runtime accepted it.
                (_, None) => true,
                (_, Some(_)) => {
                    stats.lost += 1;
                    instance.phase = InstancePhase::Terminated;
                    changed.insert(instance.spec_name.clone());
                    true
                }
            }
        });

        if let Some(max_seq) = max_seq {
            self.seq.fetch_max(max_seq + 1, Ordering::SeqCst);
        }

        // Recovering from an outage wakes every spec, not just changed ones.
        if !self.runtime_available.swap(true, Ordering::SeqCst) {
            info!("Runtime reachable again, resuming reconciliation");
            changed.extend(instances.values().map(|i| i.spec_name.clone()));
        }
        // Set under the write lock: a reader that sees `synced` also sees
        // the relisted entries.
        if !self.synced.send_replace(true) {
            info!(instances = instances.len(), "Initial relist complete");
        }
        drop(instances);

        if stats.lost > 0 {
            warn!(lost = stats.lost, "Relist found instances missing from the runtime");
        }
        debug!(
            listed = stats.listed,
            added = stats.added,
            updated = stats.updated,
            dropped = stats.dropped,
            "Relist complete"
        );

        for name in &changed {
            self.publish(name);
        }
        Ok(stats)
    }

    /// Consume runtime events and relist periodically until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            relist_interval_secs = self.relist_interval.as_secs(),
            "Starting observed state collector"
        );

        let mut events = self.runtime.events();
        let mut events_open = true;
        let mut relist_interval = tokio::time::interval(self.relist_interval);

        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Ok(event) => {
                        self.apply_event(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Runtime events lagged, relisting");
                        if let Err(e) = self.relist().await {
                            warn!(error = %e, "Relist failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Runtime event stream closed, relying on relists");
                        events_open = false;
                    }
                },
                _ = relist_interval.tick() => {
                    if let Err(e) = self.relist().await {
                        warn!(error = %e, "Relist failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Observed state collector shutting down");
                        break;
                    }
                }
            }
        }
    }
}
