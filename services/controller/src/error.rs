//! Error taxonomy for the controller.
//!
//! Only [`ValidationError`] is terminal; everything else is transient and
//! handled by per-instance backoff or by pausing the affected specs.

use std::path::PathBuf;

use rekon_id::{IdError, NodeName};
use thiserror::Error;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Malformed desired state. Rejected synchronously at `put` time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid resource name: {0}")]
    InvalidName(#[from] IdError),

    #[error("replica count must be non-negative, got {0}")]
    NegativeReplicas(i64),

    #[error("replica count {0} is too large")]
    TooManyReplicas(i64),

    #[error("container image must not be empty")]
    EmptyImage,

    #[error("duplicate mount path {}", .0.display())]
    DuplicateMountPath(PathBuf),

    #[error("{field} must be an absolute UTF-8 path, got {}", .path.display())]
    InvalidPath { field: &'static str, path: PathBuf },

    #[error("failed to read {}: {message}", .path.display())]
    Unreadable { path: PathBuf, message: String },

    #[error("malformed document: {0}")]
    Document(String),
}

/// Errors raised while driving observed state toward desired state.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unschedulable: {0}")]
    Unschedulable(String),

    #[error("volume {volume} unavailable on node {node}: {} is not accessible", .path.display())]
    VolumeUnavailable {
        volume: String,
        node: NodeName,
        path: PathBuf,
    },

    #[error("instance start failed: {0}")]
    InstanceStart(String),

    #[error("instance stop failed: {0}")]
    InstanceStop(String),

    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl ControllerError {
    /// Returns true if the operation should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    /// Returns true if this error pauses reconciliation instead of counting
    /// as an instance failure.
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }

    /// Short machine-readable reason, used in status output.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Unschedulable(_) => "Unschedulable",
            Self::VolumeUnavailable { .. } => "VolumeUnavailable",
            Self::InstanceStart(_) => "InstanceStartError",
            Self::InstanceStop(_) => "InstanceStopError",
            Self::RuntimeUnavailable(_) => "RuntimeUnavailable",
            Self::Store(_) => "StoreError",
        }
    }
}
