//! Desired state store.
//!
//! Durable record of submitted specs, one per name. Every accepted `put`
//! either leaves the record untouched (identical resubmission) or writes a
//! new revision. `delete` only tombstones: tearing down instances is the
//! reconciler's job, and it purges the record once nothing is left.
//!
//! Two backends implement [`DesiredStateStore`]:
//! - [`MemoryStore`] for tests and embedded use
//! - [`SqliteStore`] so the CLI and the daemon can share state through a file

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::Utc;
use rekon_id::ResourceName;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::ValidationError;
use crate::model::{ResourceSpec, StoredSpec};

/// Capacity of the change notification channel.
const NOTIFY_CAPACITY: usize = 256;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record for {name}: {message}")]
    Corrupt { name: String, message: String },
}

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutResult {
    /// Revision now current for the name.
    pub revision: u64,

    /// False when the submission matched the current revision exactly.
    pub changed: bool,
}

/// Desired state store interface.
pub trait DesiredStateStore: Send + Sync {
    /// Validate and persist a spec, returning its resolved revision.
    fn put(&self, spec: ResourceSpec) -> Result<PutResult, StoreError>;

    /// Fetch the current record, tombstoned or not.
    fn get(&self, name: &ResourceName) -> Result<Option<StoredSpec>, StoreError>;

    /// Tombstone a spec. Returns the tombstoned record, or `None` if unknown.
    fn delete(&self, name: &ResourceName) -> Result<Option<StoredSpec>, StoreError>;

    /// All records, ordered by name.
    fn list(&self) -> Result<Vec<StoredSpec>, StoreError>;

    /// Remove a tombstoned record. Live records are left alone.
    ///
    /// Returns true if a record was removed.
    fn purge(&self, name: &ResourceName) -> Result<bool, StoreError>;

    /// Subscribe to change notifications (the name of each changed spec).
    fn subscribe(&self) -> broadcast::Receiver<ResourceName>;
}

/// Change notifications shared by both backends.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    tx: broadcast::Sender<ResourceName>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { tx }
    }

    pub(crate) fn notify(&self, name: &ResourceName) {
        // No receivers is fine: the periodic pass picks the change up.
        let _ = self.tx.send(name.clone());
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ResourceName> {
        self.tx.subscribe()
    }
}

/// Decide the record a `put` produces.
///
/// Returns `None` when the spec matches the current live revision exactly.
pub(crate) fn next_record(
    existing: Option<&StoredSpec>,
    spec: ResourceSpec,
) -> Result<Option<StoredSpec>, ValidationError> {
    spec.validate()?;

    if let Some(current) = existing {
        if !current.deleted && current.spec == spec {
            return Ok(None);
        }
    }

    if spec.replicas > 1 && !spec.template.volume_mounts.is_empty() {
        warn!(
            spec = %spec.name,
            replicas = spec.replicas,
            "host-path volumes resolve per node; replicas on different nodes see different data"
        );
    }

    let template_hash = spec.template.hash();
    Ok(Some(StoredSpec {
        revision: existing.map_or(1, |s| s.revision + 1),
        template_hash,
        deleted: false,
        updated_at: Utc::now(),
        spec,
    }))
}
