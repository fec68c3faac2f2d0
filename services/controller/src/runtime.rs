//! Container runtime interface and mock implementation.
//!
//! The runtime is an external collaborator. The controller only needs to:
//! - start an instance from an [`InstanceSpec`] and get a handle back
//! - stop an instance by handle
//! - list everything it runs (the authoritative view used for relists)
//! - subscribe to phase transitions
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rekon_id::{HandleId, InstanceId};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::ControllerError;
use crate::model::{InstanceHandle, InstancePhase, InstanceSpec};

/// Capacity of the runtime event channel. Slow subscribers lag and relist.
const EVENT_CAPACITY: usize = 1024;

/// Errors reported by a runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The runtime cannot be reached at all.
    #[error("runtime unreachable: {0}")]
    Unavailable(String),

    /// The runtime refused or failed to start the instance.
    #[error("{0}")]
    StartFailed(String),

    /// The runtime failed to stop the instance.
    #[error("{0}")]
    StopFailed(String),
}

impl RuntimeError {
    pub fn into_start_error(self) -> ControllerError {
        match self {
            Self::Unavailable(msg) => ControllerError::RuntimeUnavailable(msg),
            other => ControllerError::InstanceStart(other.to_string()),
        }
    }

    pub fn into_stop_error(self) -> ControllerError {
        match self {
            Self::Unavailable(msg) => ControllerError::RuntimeUnavailable(msg),
            other => ControllerError::InstanceStop(other.to_string()),
        }
    }
}

/// A phase transition reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub instance_id: InstanceId,
    pub phase: InstancePhase,
    pub message: Option<String>,
}

/// One unit as reported by [`Runtime::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInstance {
    pub spec: InstanceSpec,
    pub handle: InstanceHandle,
    pub phase: InstancePhase,
}

/// Container runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start an instance. Returns once the runtime accepted the request.
    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle, RuntimeError>;

    /// Stop a running instance.
    async fn stop(&self, handle: &InstanceHandle) -> Result<(), RuntimeError>;

    /// Authoritative list of all units the runtime currently holds.
    async fn list(&self) -> Result<Vec<RuntimeInstance>, RuntimeError>;

    /// Subscribe to phase transitions.
    fn events(&self) -> broadcast::Receiver<RuntimeEvent>;
}

/// Mock runtime for testing and development.
///
/// Started instances go straight to `Running`; stopped ones are removed
/// after a `Terminated` event. Knobs simulate failures and dropped events.
pub struct MockRuntime {
    units: Mutex<BTreeMap<InstanceId, RuntimeInstance>>,
    events: broadcast::Sender<RuntimeEvent>,
    start_delay: Duration,

    fail_starts: AtomicBool,
    fail_stops: AtomicBool,
    unavailable: AtomicBool,
    drop_events: AtomicBool,

    starts: AtomicU64,
    stops: AtomicU64,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::with_start_delay(Duration::ZERO)
    }

    /// Create a mock runtime that takes `delay` to start each instance.
    pub fn with_start_delay(delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            units: Mutex::new(BTreeMap::new()),
            events,
            start_delay: delay,
            fail_starts: AtomicBool::new(false),
            fail_stops: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            drop_events: AtomicBool::new(false),
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    /// Make every start fail.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make every stop fail.
    pub fn set_fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    /// Simulate the runtime being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Silently drop events instead of publishing them.
    pub fn set_drop_events(&self, drop: bool) {
        self.drop_events.store(drop, Ordering::SeqCst);
    }

    /// Number of successful starts.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of successful stops.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of units currently held.
    pub fn unit_count(&self) -> usize {
        self.units().len()
    }

    /// Simulate a crash: the unit moves to `Failed`.
    pub fn crash(&self, instance_id: &InstanceId, message: &str) -> bool {
        let crashed = match self.units().get_mut(instance_id) {
            Some(unit) => {
                unit.phase = InstancePhase::Failed;
                true
            }
            None => false,
        };

        if crashed {
            self.publish(*instance_id, InstancePhase::Failed, Some(message.to_string()));
        }
        crashed
    }

    fn units(&self) -> MutexGuard<'_, BTreeMap<InstanceId, RuntimeInstance>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock runtime offline".to_string()));
        }
        Ok(())
    }

    fn publish(&self, instance_id: InstanceId, phase: InstancePhase, message: Option<String>) {
        if self.drop_events.load(Ordering::SeqCst) {
            debug!(instance_id = %instance_id, phase = %phase, "[MOCK] Dropping event");
            return;
        }
        let _ = self.events.send(RuntimeEvent {
            instance_id,
            phase,
            message,
        });
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle, RuntimeError> {
        self.check_available()?;

        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::StartFailed(
                "mock runtime configured to fail".to_string(),
            ));
        }

        info!(
            instance_id = %spec.instance_id,
            node_id = %spec.node,
            image = %spec.image,
            devices = spec.devices,
            volumes = spec.volumes.len(),
            "[MOCK] Starting instance"
        );

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let handle = InstanceHandle {
            handle_id: HandleId::new(),
            instance_id: spec.instance_id,
            node: spec.node.clone(),
        };

        self.units().insert(
            spec.instance_id,
            RuntimeInstance {
                spec: spec.clone(),
                handle: handle.clone(),
                phase: InstancePhase::Running,
            },
        );
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.publish(spec.instance_id, InstancePhase::Running, None);

        Ok(handle)
    }

    async fn stop(&self, handle: &InstanceHandle) -> Result<(), RuntimeError> {
        self.check_available()?;

        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(RuntimeError::StopFailed(
                "mock runtime configured to fail".to_string(),
            ));
        }

        info!(
            instance_id = %handle.instance_id,
            handle_id = %handle.handle_id,
            "[MOCK] Stopping instance"
        );

        // Stopping an unknown unit is not an error: it is already gone.
        if self.units().remove(&handle.instance_id).is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        self.publish(handle.instance_id, InstancePhase::Terminated, None);

        Ok(())
    }

    async fn list(&self) -> Result<Vec<RuntimeInstance>, RuntimeError> {
        self.check_available()?;
        Ok(self.units().values().cloned().collect())
    }

    fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}
