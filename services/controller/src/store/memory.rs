//! In-memory desired state store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rekon_id::ResourceName;
use tokio::sync::broadcast;
use tracing::debug;

use super::{next_record, DesiredStateStore, Notifier, PutResult, StoreError};
use crate::model::{ResourceSpec, StoredSpec};

/// Desired state kept in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    specs: Mutex<BTreeMap<ResourceName, StoredSpec>>,
    notifier: Notifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            specs: Mutex::new(BTreeMap::new()),
            notifier: Notifier::new(),
        }
    }

    fn specs(&self) -> MutexGuard<'_, BTreeMap<ResourceName, StoredSpec>> {
        self.specs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DesiredStateStore for MemoryStore {
    fn put(&self, spec: ResourceSpec) -> Result<PutResult, StoreError> {
        let name = spec.name.clone();
        let mut specs = self.specs();

        let Some(record) = next_record(specs.get(&name), spec)? else {
            let revision = specs.get(&name).map_or(0, |s| s.revision);
            return Ok(PutResult {
                revision,
                changed: false,
            });
        };

        let revision = record.revision;
        specs.insert(name.clone(), record);
        drop(specs);

        debug!(spec = %name, revision, "Stored desired state");
        self.notifier.notify(&name);
        Ok(PutResult {
            revision,
            changed: true,
        })
    }

    fn get(&self, name: &ResourceName) -> Result<Option<StoredSpec>, StoreError> {
        Ok(self.specs().get(name).cloned())
    }

    fn delete(&self, name: &ResourceName) -> Result<Option<StoredSpec>, StoreError> {
        let tombstone = {
            let mut specs = self.specs();
            let Some(record) = specs.get_mut(name) else {
                return Ok(None);
            };
            if !record.deleted {
                record.deleted = true;
                record.updated_at = Utc::now();
            }
            record.clone()
        };

        self.notifier.notify(name);
        Ok(Some(tombstone))
    }

    fn list(&self) -> Result<Vec<StoredSpec>, StoreError> {
        Ok(self.specs().values().cloned().collect())
    }

    fn purge(&self, name: &ResourceName) -> Result<bool, StoreError> {
        let mut specs = self.specs();
        if specs.get(name).is_some_and(|s| s.deleted) {
            specs.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceName> {
        self.notifier.subscribe()
    }
}
