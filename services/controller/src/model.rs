//! Desired and observed state types.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rekon_id::{HandleId, InstanceId, NodeName, ResourceName};
use rekon_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A host-path volume mounted into every instance of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name, used in logs and error messages.
    pub name: String,

    /// Path on the node's filesystem.
    pub host_path: PathBuf,

    /// Path inside the instance. Unique per template.
    pub mount_path: PathBuf,

    #[serde(default)]
    pub read_only: bool,
}

/// Resource requests of one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Devices (GPUs) granted to each instance.
    #[serde(default)]
    pub device_count: u32,
}

/// Template every instance of a spec is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub image: String,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl PodTemplate {
    /// Hash of the template, used to detect instances created from an older one.
    pub fn hash(&self) -> SpecHash {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        SpecHash::from_json(&value)
    }
}

/// Desired state of one named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub name: ResourceName,

    /// Desired replica count. Signed so that negative input reaches validation.
    pub replicas: i64,

    pub template: PodTemplate,
}

impl ResourceSpec {
    /// Validate the spec.
    ///
    /// Names are validated by construction; this checks everything else.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.replicas < 0 {
            return Err(ValidationError::NegativeReplicas(self.replicas));
        }

        if self.replicas > i64::from(u32::MAX) {
            return Err(ValidationError::TooManyReplicas(self.replicas));
        }

        if self.template.image.trim().is_empty() {
            return Err(ValidationError::EmptyImage);
        }

        let mut seen = BTreeSet::new();
        for mount in &self.template.volume_mounts {
            check_path("hostPath", &mount.host_path)?;
            check_path("mountPath", &mount.mount_path)?;

            if !seen.insert(mount.mount_path.as_path()) {
                return Err(ValidationError::DuplicateMountPath(mount.mount_path.clone()));
            }
        }

        Ok(())
    }

    /// Desired replicas as an unsigned count. Only meaningful after validation.
    pub fn desired_replicas(&self) -> u32 {
        u32::try_from(self.replicas.max(0)).unwrap_or(u32::MAX)
    }
}

fn check_path(field: &'static str, path: &Path) -> Result<(), ValidationError> {
    if path.is_absolute() && path.to_str().is_some() {
        Ok(())
    } else {
        Err(ValidationError::InvalidPath {
            field,
            path: path.to_path_buf(),
        })
    }
}

/// A persisted revision of a [`ResourceSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSpec {
    pub spec: ResourceSpec,

    /// Monotonically increasing per name.
    pub revision: u64,

    pub template_hash: SpecHash,

    /// Tombstone: set by `delete`, cleared by a later `put`.
    pub deleted: bool,

    pub updated_at: DateTime<Utc>,
}

impl StoredSpec {
    pub fn name(&self) -> &ResourceName {
        &self.spec.name
    }

    /// Replicas the reconciler should converge to. Zero once tombstoned.
    pub fn effective_replicas(&self) -> u32 {
        if self.deleted {
            0
        } else {
            self.spec.desired_replicas()
        }
    }
}

/// Instance lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstancePhase {
    /// Requested or starting, not yet running.
    Pending,
    /// Running on its node.
    Running,
    /// Crashed or failed to start.
    Failed,
    /// Stopped; kept briefly so the transition is observable.
    Terminated,
}

impl InstancePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Returns true for phases counted toward the desired replica count.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true for phases no event can move an instance out of.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host path resolved for a specific node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundVolume {
    pub name: String,
    pub host_path: PathBuf,
    pub mount_path: PathBuf,
    pub read_only: bool,
}

/// Everything the runtime needs to start an instance.
///
/// The runtime keeps this with the running unit and returns it from `list`,
/// which is how a relist rebuilds the observed view from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub instance_id: InstanceId,
    pub spec_name: ResourceName,
    pub revision: u64,
    pub template_hash: SpecHash,
    pub node: NodeName,
    pub image: String,
    pub devices: u32,
    pub volumes: Vec<BoundVolume>,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Handle to a unit started by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub handle_id: HandleId,
    pub instance_id: InstanceId,
    pub node: NodeName,
}

/// Observed state of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub spec_name: ResourceName,
    pub revision: u64,
    pub template_hash: SpecHash,
    pub node: NodeName,
    pub devices: u32,
    pub phase: InstancePhase,

    /// Creation order across the controller; breaks ties between instances
    /// created within the same millisecond.
    pub seq: u64,
    pub created_at: DateTime<Utc>,

    /// Set once the runtime accepted the start request.
    pub handle: Option<InstanceHandle>,

    /// Selected for termination; no longer counts toward desired replicas.
    pub terminating: bool,

    pub message: Option<String>,
}

impl Instance {
    /// A freshly requested instance, not yet known to the runtime.
    pub fn requested(spec: &InstanceSpec) -> Self {
        Self {
            id: spec.instance_id,
            spec_name: spec.spec_name.clone(),
            revision: spec.revision,
            template_hash: spec.template_hash.clone(),
            node: spec.node.clone(),
            devices: spec.devices,
            phase: InstancePhase::Pending,
            seq: spec.seq,
            created_at: spec.created_at,
            handle: None,
            terminating: false,
            message: None,
        }
    }

    /// Counts toward the desired replica count.
    pub fn is_active(&self) -> bool {
        self.phase.is_active() && !self.terminating
    }

    /// Ordering key for LIFO scale-down.
    ///
    /// `seq` comes first: it is monotonic across restarts, the wall clock
    /// is not.
    pub fn creation_key(&self) -> (u64, DateTime<Utc>) {
        (self.seq, self.created_at)
    }
}
