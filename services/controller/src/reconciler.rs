//! Reconciler for desired replica counts.
//!
//! One pass for a spec:
//! - Reads the desired record from the store and the observed instances
//!   from the collector
//! - Cleans up: releases capacity of terminated instances, tears down
//!   failed ones, retries stops that failed earlier
//! - Plans with [`RollingStrategy`]: start missing instances, drain
//!   surplus ones (LIFO), replace instances built from an older template
//! - Places new instances and starts them in spawned tasks
//! - Purges tombstoned specs once nothing is left
//!
//! Passes are level-triggered: everything is re-derived from current state
//! and an unchanged state produces no actions. Runtime calls never block a
//! pass; their outcome reaches the next pass through the collector.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rekon_id::{InstanceId, ResourceName};
use rekon_reconcile::{
    classify_instances, select_for_termination, ActiveCounts, BackoffPolicy, ConvergenceStatus,
    RetryTracker, RollingStrategy,
};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::collector::ObservedStateCollector;
use crate::error::{ControllerError, ControllerResult};
use crate::model::{Instance, InstanceHandle, InstancePhase, InstanceSpec, StoredSpec, VolumeMount};
use crate::placement::{Placement, PlacementRequest};
use crate::runtime::Runtime;
use crate::store::DesiredStateStore;
use crate::volumes::VolumeBinder;

/// Where a spec's loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    Idle,
    Diffing,
    Acting,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Diffing => "diffing",
            Self::Acting => "acting",
        }
    }
}

/// A replica slot that could not be filled yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingSlot {
    pub slot: u32,
    pub reason: String,
    pub failures: u32,
    pub retry_in: Option<Duration>,
}

/// Reconciliation status of one spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecStatus {
    pub name: ResourceName,
    pub revision: u64,
    pub deleted: bool,
    pub desired: u32,
    pub running: u32,
    pub pending: u32,
    pub failed: u32,
    pub terminating: u32,

    /// Active instances built from an older template.
    pub outdated: u32,
    pub waiting: Vec<WaitingSlot>,
    pub last_error: Option<String>,
    pub convergence: ConvergenceStatus,
    pub phase: LoopPhase,
    pub updated_at: DateTime<Utc>,
}

impl SpecStatus {
    fn new(name: ResourceName) -> Self {
        Self {
            name,
            revision: 0,
            deleted: false,
            desired: 0,
            running: 0,
            pending: 0,
            failed: 0,
            terminating: 0,
            outdated: 0,
            waiting: Vec::new(),
            last_error: None,
            convergence: ConvergenceStatus::Unknown,
            phase: LoopPhase::Idle,
            updated_at: Utc::now(),
        }
    }
}

/// Statistics from one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub instances_started: u32,
    pub instances_drained: u32,
    pub instances_released: u32,
    pub slots_waiting: u32,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        self.instances_started == 0 && self.instances_drained == 0
    }
}

/// Result of one pass.
#[derive(Debug, Default, Clone)]
pub struct PassOutcome {
    pub stats: ReconcileStats,

    /// Earliest time a backed-off action becomes retryable.
    pub requeue_after: Option<Duration>,

    /// The spec is gone (tombstone purged, or never stored and nothing
    /// left running); its loop can stop.
    pub purged: bool,
}

/// Reconciler configuration.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    pub backoff: BackoffPolicy,
    pub strategy: RollingStrategy,
}

fn slot_key(name: &ResourceName, slot: u32) -> String {
    format!("{name}/slot-{slot}")
}

fn stop_key(name: &ResourceName, id: &InstanceId) -> String {
    format!("{name}/{id}")
}

fn retry_prefix(name: &ResourceName) -> String {
    format!("{name}/")
}

/// The reconciler.
pub struct Reconciler {
    store: Arc<dyn DesiredStateStore>,
    collector: Arc<ObservedStateCollector>,
    placement: Arc<Placement>,
    volumes: VolumeBinder,
    runtime: Arc<dyn Runtime>,
    strategy: RollingStrategy,
    retries: Mutex<RetryTracker>,
    statuses: RwLock<BTreeMap<ResourceName, SpecStatus>>,

    /// Runtime calls currently running in spawned tasks.
    in_flight: Mutex<HashMap<InstanceId, ResourceName>>,
    idle: Notify,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn DesiredStateStore>,
        collector: Arc<ObservedStateCollector>,
        placement: Arc<Placement>,
        volumes: VolumeBinder,
        runtime: Arc<dyn Runtime>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            collector,
            placement,
            volumes,
            runtime,
            strategy: config.strategy,
            retries: Mutex::new(RetryTracker::new(config.backoff)),
            statuses: RwLock::new(BTreeMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DesiredStateStore> {
        &self.store
    }

    pub fn collector(&self) -> &Arc<ObservedStateCollector> {
        &self.collector
    }

    pub fn placement(&self) -> &Arc<Placement> {
        &self.placement
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<InstanceId, ResourceName>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest status of a spec, if it has been reconciled.
    pub fn status(&self, name: &ResourceName) -> Option<SpecStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Latest status of every reconciled spec.
    pub fn statuses(&self) -> Vec<SpecStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn set_phase(&self, name: &ResourceName, phase: LoopPhase) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.clone())
            .or_insert_with(|| SpecStatus::new(name.clone()))
            .phase = phase;
    }

    fn set_status(&self, status: SpecStatus) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.name.clone(), status);
    }

    fn forget(&self, name: &ResourceName) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.retries().clear_prefix(&retry_prefix(name));
    }

    /// Wait until no spawned runtime call is outstanding.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn begin(&self, id: InstanceId, name: &ResourceName) {
        self.in_flight().insert(id, name.clone());
    }

    fn finish(&self, id: &InstanceId) {
        let mut in_flight = self.in_flight();
        in_flight.remove(id);
        if in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn is_in_flight(&self, id: &InstanceId) -> bool {
        self.in_flight().contains_key(id)
    }

    fn spec_in_flight(&self, name: &ResourceName) -> bool {
        self.in_flight().values().any(|n| n == name)
    }

    /// Run one pass for a spec.
    #[instrument(skip(self, name), fields(spec = %name))]
    pub async fn reconcile(self: &Arc<Self>, name: &ResourceName) -> ControllerResult<PassOutcome> {
        self.set_phase(name, LoopPhase::Diffing);
        let result = self.pass(name).await;
        if let Err(e) = &result {
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = statuses.get_mut(name) {
                status.phase = LoopPhase::Idle;
                status.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn pass(self: &Arc<Self>, name: &ResourceName) -> ControllerResult<PassOutcome> {
        // Checked before listing: an unsynced view misses instances that
        // outlived a restart, and acting on it would start duplicates.
        if !self.collector.is_synced() {
            debug!("Observed state not synced yet, skipping actions");
            self.pause(name, "waiting for first relist");
            return Ok(PassOutcome::default());
        }

        let record = self.store.get(name)?;
        let instances = self.collector.list(name).await;

        // Nothing desired and nothing left but terminated instances.
        if record.is_none()
            && instances.iter().all(|i| i.phase == InstancePhase::Terminated)
            && !self.spec_in_flight(name)
        {
            for instance in &instances {
                self.placement.release(&instance.node, &instance.id);
            }
            self.forget(name);
            return Ok(PassOutcome {
                purged: true,
                ..PassOutcome::default()
            });
        }

        if !self.collector.runtime_available() {
            debug!("Runtime unavailable, skipping actions");
            self.pause(name, "runtime unavailable");
            return Ok(PassOutcome::default());
        }

        let mut outcome = PassOutcome::default();
        self.cleanup(name, &instances, &mut outcome.stats).await;

        let desired = record.as_ref().map_or(0, StoredSpec::effective_replicas);
        let desired_hash = record.as_ref().map(|r| r.template_hash.clone());

        let active: Vec<_> = instances.iter().filter(|i| i.is_active()).cloned().collect();
        let (matching, outdated) = match &desired_hash {
            Some(hash) => classify_instances(active, hash, |i| &i.template_hash),
            // No record: whatever is left is surplus.
            None => (active, Vec::new()),
        };
        let counts = active_counts(&matching, &outdated);
        let plan = self.strategy.plan(desired, counts);

        if !plan.is_empty() {
            self.set_phase(name, LoopPhase::Acting);
            debug!(
                desired,
                active = counts.total(),
                outdated = counts.outdated(),
                start = plan.start,
                drain_outdated = plan.drain_outdated,
                drain_matching = plan.drain_matching,
                "Computed scale plan"
            );
        }

        outcome.stats.instances_drained += self.drain(name, outdated, plan.drain_outdated).await;
        outcome.stats.instances_drained += self.drain(name, matching, plan.drain_matching).await;

        let mut waiting = Vec::new();
        if let Some(record) = record.as_ref().filter(|r| !r.deleted) {
            let started = self
                .scale_up(record, plan.start, counts.matching(), &mut waiting)
                .await;
            outcome.stats.instances_started = started;
        }
        outcome.stats.slots_waiting = waiting.len() as u32;
        self.clear_stale_slots(name, desired);

        // Tombstoned and fully torn down: drop the record.
        if let Some(record) = record.as_ref().filter(|r| r.deleted) {
            let remaining = self.collector.list(name).await;
            if remaining.iter().all(|i| i.phase == InstancePhase::Terminated)
                && !self.spec_in_flight(name)
            {
                for instance in &remaining {
                    self.placement.release(&instance.node, &instance.id);
                }
                if self.store.purge(name)? {
                    info!(revision = record.revision, "Purged deleted spec");
                }
                self.forget(name);
                outcome.purged = true;
                return Ok(outcome);
            }
        }

        let status = self
            .build_status(name, record.as_ref(), desired, waiting)
            .await;
        if outcome.stats.instances_started > 0 || outcome.stats.instances_drained > 0 {
            info!(
                started = outcome.stats.instances_started,
                drained = outcome.stats.instances_drained,
                waiting = outcome.stats.slots_waiting,
                convergence = %status.convergence,
                "Reconciliation pass acted"
            );
        }
        self.set_status(status);

        outcome.requeue_after = self
            .retries()
            .next_retry_with_prefix(&retry_prefix(name))
            .map(|at| at.saturating_duration_since(Instant::now()));
        Ok(outcome)
    }

    /// Record a pass that took no action because observed state can't be
    /// trusted.
    fn pause(&self, name: &ResourceName, reason: &str) {
        let mut status = self.status(name).unwrap_or_else(|| SpecStatus::new(name.clone()));
        status.convergence = ConvergenceStatus::Unknown;
        status.phase = LoopPhase::Idle;
        status.last_error = Some(reason.to_string());
        status.updated_at = Utc::now();
        self.set_status(status);
    }

    /// Drop the backoff of replica slots at or above `desired`.
    ///
    /// Those slots no longer exist; a later scale-up starts them with no
    /// failure history.
    fn clear_stale_slots(&self, name: &ResourceName, desired: u32) {
        let prefix = format!("{}slot-", retry_prefix(name));
        self.retries().clear_matching(|key| {
            key.strip_prefix(&prefix)
                .and_then(|slot| slot.parse::<u32>().ok())
                .is_some_and(|slot| slot >= desired)
        });
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    async fn cleanup(
        self: &Arc<Self>,
        name: &ResourceName,
        instances: &[Instance],
        stats: &mut ReconcileStats,
    ) {
        for instance in instances {
            if self.is_in_flight(&instance.id) {
                continue;
            }

            match instance.phase {
                InstancePhase::Terminated => {
                    if self.placement.release(&instance.node, &instance.id) {
                        stats.instances_released += 1;
                    }
                    self.retries().clear(&stop_key(name, &instance.id));
                }
                InstancePhase::Failed if instance.handle.is_none() => {
                    // Never accepted by the runtime; nothing to stop.
                    debug!(instance_id = %instance.id, "Clearing instance that failed to start");
                    self.collector.mark_terminated(&instance.id).await;
                    if self.placement.release(&instance.node, &instance.id) {
                        stats.instances_released += 1;
                    }
                }
                InstancePhase::Failed => {
                    if !instance.terminating {
                        warn!(
                            instance_id = %instance.id,
                            node_id = %instance.node,
                            message = instance.message.as_deref().unwrap_or(""),
                            "Instance failed, replacing"
                        );
                        self.collector.mark_terminating(&instance.id).await;
                    }
                    self.stop(name, instance);
                }
                InstancePhase::Pending | InstancePhase::Running if instance.terminating => {
                    self.stop(name, instance);
                }
                InstancePhase::Pending | InstancePhase::Running => {
                    // Binding may predate this process (controller restart).
                    if instance.handle.is_some()
                        && self.placement.adopt(&instance.node, instance.id, instance.devices)
                    {
                        debug!(instance_id = %instance.id, node_id = %instance.node, "Adopted binding");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Scale down
    // =========================================================================

    async fn drain(
        self: &Arc<Self>,
        name: &ResourceName,
        candidates: Vec<Instance>,
        count: u32,
    ) -> u32 {
        if count == 0 {
            return 0;
        }

        let victims = select_for_termination(candidates, count as usize, Instance::creation_key);
        let mut drained = 0;
        for instance in victims {
            if !self.collector.mark_terminating(&instance.id).await {
                continue;
            }
            debug!(instance_id = %instance.id, node_id = %instance.node, seq = instance.seq, "Draining instance");
            drained += 1;
            // Without a handle the start is still in flight; it stops the
            // instance itself once the handle arrives.
            if instance.handle.is_some() {
                self.stop(name, &instance);
            }
        }
        drained
    }

    fn stop(self: &Arc<Self>, name: &ResourceName, instance: &Instance) {
        let Some(handle) = instance.handle.clone() else {
            return;
        };
        let key = stop_key(name, &instance.id);
        if self.is_in_flight(&instance.id) || !self.retries().is_ready(&key) {
            return;
        }

        let id = instance.id;
        self.begin(id, name);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.stop_instance(handle, key).await;
            this.finish(&id);
        });
    }

    async fn stop_instance(&self, handle: InstanceHandle, key: String) {
        match self.runtime.stop(&handle).await {
            Ok(()) => {
                self.collector.mark_terminated(&handle.instance_id).await;
                self.placement.release(&handle.node, &handle.instance_id);
                self.retries().clear(&key);
            }
            Err(e) => {
                let err = e.into_stop_error();
                if err.is_runtime_unavailable() {
                    self.collector.mark_runtime_unavailable(&err.to_string());
                } else {
                    let delay = self.retries().record_failure(&key, err.to_string());
                    warn!(
                        instance_id = %handle.instance_id,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to stop instance"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Scale up
    // =========================================================================

    /// Fill `count` replica slots numbered from `first_slot`.
    ///
    /// Slot numbers follow the active count, so a slot that keeps failing
    /// keeps its backoff across passes.
    async fn scale_up(
        self: &Arc<Self>,
        record: &StoredSpec,
        count: u32,
        first_slot: u32,
        waiting: &mut Vec<WaitingSlot>,
    ) -> u32 {
        let name = record.name();
        let template = &record.spec.template;
        let mut started = 0;

        for slot in first_slot..first_slot + count {
            let key = slot_key(name, slot);

            let ready = self.retries().is_ready(&key);
            if !ready {
                waiting.push(self.waiting_slot(slot, &key));
                continue;
            }

            let instance_id = InstanceId::new();
            let request = PlacementRequest {
                instance_id,
                spec_name: name.clone(),
                devices: template.resources.device_count,
            };

            let node = match self.placement.place(&request) {
                Ok(node) => node,
                Err(e) => {
                    let delay = self.retries().record_failure(&key, e.to_string());
                    debug!(
                        slot,
                        reason = e.reason(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Replica slot waiting"
                    );
                    waiting.push(self.waiting_slot(slot, &key));
                    continue;
                }
            };

            let spec = InstanceSpec {
                instance_id,
                spec_name: name.clone(),
                revision: record.revision,
                template_hash: record.template_hash.clone(),
                node,
                image: template.image.clone(),
                devices: template.resources.device_count,
                volumes: Vec::new(),
                seq: self.collector.next_seq(),
                created_at: Utc::now(),
            };
            self.collector.record_pending(&spec).await;
            self.begin(instance_id, name);
            started += 1;

            let this = Arc::clone(self);
            let mounts = template.volume_mounts.clone();
            tokio::spawn(async move {
                this.start_instance(spec, mounts, key).await;
                this.finish(&instance_id);
            });
        }

        started
    }

    fn waiting_slot(&self, slot: u32, key: &str) -> WaitingSlot {
        let retries = self.retries();
        WaitingSlot {
            slot,
            reason: retries.last_error(key).unwrap_or_default().to_string(),
            failures: retries.failures(key),
            retry_in: retries.retry_in(key),
        }
    }

    async fn start_instance(&self, mut spec: InstanceSpec, mounts: Vec<VolumeMount>, key: String) {
        let id = spec.instance_id;

        let result = match self.volumes.bind_all(&mounts, &spec.node) {
            Ok(volumes) => {
                spec.volumes = volumes;
                self.runtime
                    .start(&spec)
                    .await
                    .map_err(|e| e.into_start_error())
            }
            Err(e) => Err(e),
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                self.start_failed(&spec, &key, err).await;
                return;
            }
        };

        self.retries().clear(&key);
        info!(
            instance_id = %id,
            spec = %spec.spec_name,
            node_id = %spec.node,
            devices = spec.devices,
            "Instance started"
        );

        let attached = self.collector.set_handle(handle.clone()).await;
        let drain_now = !attached
            || self
                .collector
                .get(&id)
                .await
                .is_some_and(|instance| instance.terminating);
        if drain_now {
            debug!(instance_id = %id, "Instance drained while starting, stopping");
            self.stop_instance(handle, stop_key(&spec.spec_name, &id)).await;
        }
    }

    async fn start_failed(&self, spec: &InstanceSpec, key: &str, err: ControllerError) {
        if err.is_runtime_unavailable() {
            self.collector.mark_runtime_unavailable(&err.to_string());
        } else {
            let delay = self.retries().record_failure(key, err.to_string());
            warn!(
                instance_id = %spec.instance_id,
                node_id = %spec.node,
                reason = err.reason(),
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to start instance"
            );
        }
        self.collector.mark_failed(&spec.instance_id, err.to_string()).await;
    }

    // =========================================================================
    // Status
    // =========================================================================

    async fn build_status(
        &self,
        name: &ResourceName,
        record: Option<&StoredSpec>,
        desired: u32,
        waiting: Vec<WaitingSlot>,
    ) -> SpecStatus {
        let instances = self.collector.list(name).await;
        let mut status = SpecStatus::new(name.clone());
        status.revision = record.map_or(0, |r| r.revision);
        status.deleted = record.is_none_or(|r| r.deleted);
        status.desired = desired;

        for instance in &instances {
            if instance.terminating && !instance.phase.is_final() {
                status.terminating += 1;
                continue;
            }
            match instance.phase {
                InstancePhase::Running => status.running += 1,
                InstancePhase::Pending => status.pending += 1,
                InstancePhase::Failed => status.failed += 1,
                InstancePhase::Terminated => {}
            }
            let outdated = record.is_some_and(|r| r.template_hash != instance.template_hash);
            if instance.is_active() && outdated {
                status.outdated += 1;
            }
        }

        status.last_error = waiting
            .iter()
            .map(|w| w.reason.clone())
            .find(|r| !r.is_empty());
        status.convergence = if !waiting.is_empty() {
            ConvergenceStatus::Diverged
        } else if status.running == desired
            && status.pending == 0
            && status.failed == 0
            && status.terminating == 0
            && status.outdated == 0
        {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        };
        status.waiting = waiting;
        status.phase = LoopPhase::Idle;
        status
    }
}

fn active_counts(matching: &[Instance], outdated: &[Instance]) -> ActiveCounts {
    let count = |instances: &[Instance], phase| {
        instances.iter().filter(|i| i.phase == phase).count() as u32
    };
    ActiveCounts {
        matching_running: count(matching, InstancePhase::Running),
        matching_pending: count(matching, InstancePhase::Pending),
        outdated_running: count(outdated, InstancePhase::Running),
        outdated_pending: count(outdated, InstancePhase::Pending),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::runtime::MockRuntime;
    use crate::store::MemoryStore;
    use crate::testing::{mpi_spec, node};
    use crate::volumes::StaticHostPaths;

    struct Harness {
        runtime: Arc<MockRuntime>,
        store: Arc<MemoryStore>,
        reconciler: Arc<Reconciler>,
        name: ResourceName,
    }

    fn harness_with_paths(nodes: &[(&str, u32)], paths: StaticHostPaths) -> Harness {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(MemoryStore::new());
        let collector = Arc::new(ObservedStateCollector::new(
            runtime.clone(),
            Duration::from_secs(60),
        ));
        let placement = Arc::new(Placement::with_nodes(
            nodes.iter().map(|(n, c)| (node(n), *c)),
        ));
        let config = ReconcilerConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                max: Duration::from_millis(40),
                jitter: 0.0,
            },
            strategy: RollingStrategy::default(),
        };
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            collector,
            placement,
            VolumeBinder::new(Arc::new(paths)),
            runtime.clone(),
            config,
        ));
        Harness {
            runtime,
            store,
            reconciler,
            name: ResourceName::parse("mpi").unwrap(),
        }
    }

    fn harness(nodes: &[(&str, u32)]) -> Harness {
        let paths = StaticHostPaths::new()
            .with_shared_path("/srv/shared")
            .with_shared_path("/srv/datasets/mnist");
        harness_with_paths(nodes, paths)
    }

    impl Harness {
        /// One pass, then wait for its runtime calls and observe the result.
        async fn pass(&self) -> PassOutcome {
            if !self.reconciler.collector().is_synced() {
                self.reconciler.collector().relist().await.unwrap();
            }
            let outcome = self.reconciler.reconcile(&self.name).await.unwrap();
            self.reconciler.wait_for_idle().await;
            self.reconciler.collector().relist().await.unwrap();
            outcome
        }

        async fn converge(&self) -> SpecStatus {
            for _ in 0..50 {
                self.pass().await;
                if let Some(status) = self.status() {
                    if status.convergence.is_converged() {
                        return status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("did not converge: {:?}", self.status());
        }

        fn status(&self) -> Option<SpecStatus> {
            self.reconciler.status(&self.name)
        }

        async fn active(&self) -> Vec<Instance> {
            self.reconciler
                .collector()
                .list(&self.name)
                .await
                .into_iter()
                .filter(Instance::is_active)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_scale_up_one_per_node() {
        let h = harness(&[("node-a", 1), ("node-b", 1), ("node-c", 1), ("node-d", 1)]);
        h.store.put(mpi_spec(4)).unwrap();

        let first = h.pass().await;
        assert_eq!(first.stats.instances_started, 4);
        assert_eq!(first.stats.slots_waiting, 0);

        let status = h.converge().await;
        assert_eq!(status.running, 4);
        assert!(status.waiting.is_empty());

        let nodes: BTreeSet<_> = h.active().await.into_iter().map(|i| i.node).collect();
        assert_eq!(nodes.len(), 4);
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let h = harness(&[("node-a", 2), ("node-b", 2)]);
        h.store.put(mpi_spec(4)).unwrap();
        h.converge().await;

        let starts = h.runtime.start_count();
        let outcome = h.pass().await;
        assert!(outcome.stats.is_noop());
        assert_eq!(h.runtime.start_count(), starts);
        assert_eq!(h.runtime.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_unschedulable_slots_wait() {
        let h = harness(&[("node-a", 1), ("node-b", 1)]);
        h.store.put(mpi_spec(4)).unwrap();

        let outcome = h.pass().await;
        assert_eq!(outcome.stats.instances_started, 2);
        assert_eq!(outcome.stats.slots_waiting, 2);
        assert!(outcome.requeue_after.is_some());

        let status = h.status().unwrap();
        assert_eq!(status.waiting.len(), 2);
        assert_eq!(status.failed, 0);
        assert_eq!(status.convergence, ConvergenceStatus::Diverged);
        assert!(status.last_error.unwrap().contains("unschedulable"));

        // Still waiting, never failed, once the two placed instances run.
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.pass().await;
        let status = h.status().unwrap();
        assert_eq!(status.running, 2);
        assert_eq!(status.waiting.len(), 2);
        assert_eq!(h.runtime.start_count(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_is_lifo() {
        let h = harness(&[("node-a", 4)]);
        h.store.put(mpi_spec(4)).unwrap();
        h.converge().await;

        let mut before = h.active().await;
        before.sort_by_key(Instance::creation_key);
        let oldest: Vec<_> = before.iter().take(2).map(|i| i.id).collect();

        h.store.put(mpi_spec(2)).unwrap();
        let outcome = h.pass().await;
        assert_eq!(outcome.stats.instances_drained, 2);

        let status = h.converge().await;
        assert_eq!(status.running, 2);
        let mut remaining: Vec<_> = h.active().await.iter().map(|i| i.id).collect();
        remaining.sort();
        let mut expected = oldest.clone();
        expected.sort();
        assert_eq!(remaining, expected);
        assert_eq!(h.reconciler.placement().snapshot()[0].allocated, 2);
    }

    #[tokio::test]
    async fn test_delete_tears_down_and_purges() {
        let h = harness(&[("node-a", 2), ("node-b", 2)]);
        h.store.put(mpi_spec(4)).unwrap();
        h.converge().await;

        h.store.delete(&h.name).unwrap();
        let mut purged = false;
        for _ in 0..10 {
            if h.pass().await.purged {
                purged = true;
                break;
            }
        }

        assert!(purged);
        assert!(h.store.get(&h.name).unwrap().is_none());
        assert!(h.status().is_none());
        assert_eq!(h.runtime.unit_count(), 0);
        assert_eq!(h.runtime.stop_count(), 4);
        assert!(h
            .reconciler
            .placement()
            .snapshot()
            .iter()
            .all(|n| n.allocated == 0));
    }

    #[tokio::test]
    async fn test_failed_instance_is_replaced() {
        let h = harness(&[("node-a", 1), ("node-b", 1)]);
        h.store.put(mpi_spec(2)).unwrap();
        h.converge().await;

        let victim = h.active().await[0].id;
        assert!(h.runtime.crash(&victim, "oom"));
        h.reconciler.collector().relist().await.unwrap();

        let status = h.converge().await;
        assert_eq!(status.running, 2);
        assert_eq!(h.runtime.start_count(), 3);
        assert!(h.active().await.iter().all(|i| i.id != victim));
    }

    #[tokio::test]
    async fn test_volume_unavailable_fails_start() {
        let paths = StaticHostPaths::new().with_shared_path("/srv/shared");
        let h = harness_with_paths(&[("node-a", 1)], paths);
        h.store.put(mpi_spec(1)).unwrap();

        h.pass().await;
        assert_eq!(h.runtime.start_count(), 0);
        h.pass().await;

        let status = h.status().unwrap();
        assert_eq!(status.running, 0);
        assert!(status
            .waiting
            .iter()
            .any(|w| w.reason.contains("dataset")));
        // Capacity of the failed start was returned.
        assert_eq!(h.reconciler.placement().snapshot()[0].allocated, 0);
    }

    #[tokio::test]
    async fn test_no_actions_before_first_relist() {
        let h = harness(&[("node-a", 1), ("node-b", 1)]);
        h.store.put(mpi_spec(2)).unwrap();

        let outcome = h.reconciler.reconcile(&h.name).await.unwrap();
        assert!(outcome.stats.is_noop());
        assert_eq!(h.runtime.start_count(), 0);
        let status = h.status().unwrap();
        assert_eq!(status.convergence, ConvergenceStatus::Unknown);
        assert_eq!(status.last_error.as_deref(), Some("waiting for first relist"));

        assert_eq!(h.converge().await.running, 2);
    }

    #[tokio::test]
    async fn test_scale_down_clears_slot_backoff() {
        let h = harness(&[("node-a", 1)]);
        h.store.put(mpi_spec(3)).unwrap();
        h.pass().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.pass().await;
        assert_eq!(h.reconciler.retries().failures(&slot_key(&h.name, 1)), 2);

        h.store.put(mpi_spec(1)).unwrap();
        let outcome = h.pass().await;
        assert_eq!(outcome.requeue_after, None);
        assert_eq!(h.reconciler.retries().failures(&slot_key(&h.name, 1)), 0);
        assert_eq!(h.reconciler.retries().failures(&slot_key(&h.name, 2)), 0);

        // Scaling back up starts the slots with no failure history.
        h.store.put(mpi_spec(3)).unwrap();
        h.pass().await;
        let status = h.status().unwrap();
        assert_eq!(status.waiting.len(), 2);
        assert!(status.waiting.iter().all(|w| w.failures == 1));
    }

    #[tokio::test]
    async fn test_runtime_unavailable_pauses_actions() {
        let h = harness(&[("node-a", 4)]);
        h.store.put(mpi_spec(4)).unwrap();
        h.converge().await;

        h.runtime.set_unavailable(true);
        assert!(h.reconciler.collector().relist().await.is_err());

        h.store.put(mpi_spec(1)).unwrap();
        let outcome = h.reconciler.reconcile(&h.name).await.unwrap();
        assert!(outcome.stats.is_noop());
        assert_eq!(h.status().unwrap().convergence, ConvergenceStatus::Unknown);

        h.runtime.set_unavailable(false);
        h.reconciler.collector().relist().await.unwrap();
        let status = h.converge().await;
        assert_eq!(status.running, 1);
        assert_eq!(h.runtime.stop_count(), 3);
    }

    #[tokio::test]
    async fn test_template_change_rolls_instances() {
        let h = harness(&[("node-a", 1), ("node-b", 1), ("node-c", 1)]);
        h.store.put(mpi_spec(2)).unwrap();
        h.converge().await;

        let mut updated = mpi_spec(2);
        updated.template.image = "mpi-tf-worker:v2".to_string();
        let hash = updated.template.hash();
        h.store.put(updated).unwrap();

        let status = h.converge().await;
        assert_eq!(status.running, 2);
        assert_eq!(status.outdated, 0);
        assert!(h.active().await.iter().all(|i| i.template_hash == hash));
        assert_eq!(h.runtime.stop_count(), 2);
    }
}
