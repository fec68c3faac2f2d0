//! SQLite-backed desired state store.
//!
//! Durable storage shared between `rekonctl` (writes) and `rekond`
//! (reads). Changes made by another process are not pushed; the daemon's
//! periodic pass picks them up.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rekon_id::ResourceName;
use rekon_reconcile::SpecHash;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::debug;

use super::{next_record, DesiredStateStore, Notifier, PutResult, StoreError};
use crate::model::{ResourceSpec, StoredSpec};

const SELECT_COLUMNS: &str =
    "SELECT name, revision, replicas, template, template_hash, deleted, updated_at FROM specs";

/// SQLite desired state store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    notifier: Notifier,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets the CLI write while the daemon reads.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS specs (
                name TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                replicas INTEGER NOT NULL,
                template TEXT NOT NULL,
                template_hash TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Desired state schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            notifier: Notifier::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SpecRow {
    name: String,
    revision: i64,
    replicas: i64,
    template: String,
    template_hash: String,
    deleted: bool,
    updated_at: String,
}

impl SpecRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            revision: row.get(1)?,
            replicas: row.get(2)?,
            template: row.get(3)?,
            template_hash: row.get(4)?,
            deleted: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_stored(self) -> Result<StoredSpec, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            name: self.name.clone(),
            message,
        };

        let name = ResourceName::parse(&self.name).map_err(|e| corrupt(e.to_string()))?;
        let template = serde_json::from_str(&self.template)?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        let revision = u64::try_from(self.revision).map_err(|e| corrupt(e.to_string()))?;

        Ok(StoredSpec {
            spec: ResourceSpec {
                name,
                replicas: self.replicas,
                template,
            },
            revision,
            template_hash: SpecHash::from_string(self.template_hash),
            deleted: self.deleted,
            updated_at,
        })
    }
}

fn fetch(conn: &Connection, name: &str) -> Result<Option<StoredSpec>, StoreError> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE name = ?1"),
        params![name],
        SpecRow::from_row,
    )
    .optional()?
    .map(SpecRow::into_stored)
    .transpose()
}

impl DesiredStateStore for SqliteStore {
    fn put(&self, spec: ResourceSpec) -> Result<PutResult, StoreError> {
        let name = spec.name.clone();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = fetch(&tx, name.as_str())?;
        let Some(record) = next_record(existing.as_ref(), spec)? else {
            return Ok(PutResult {
                revision: existing.map_or(0, |s| s.revision),
                changed: false,
            });
        };

        tx.execute(
            r#"
            INSERT INTO specs (name, revision, replicas, template, template_hash, deleted, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            ON CONFLICT(name) DO UPDATE SET
                revision = excluded.revision,
                replicas = excluded.replicas,
                template = excluded.template,
                template_hash = excluded.template_hash,
                deleted = 0,
                updated_at = excluded.updated_at
            "#,
            params![
                name.as_str(),
                record.revision as i64,
                record.spec.replicas,
                serde_json::to_string(&record.spec.template)?,
                record.template_hash.as_str(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        drop(conn);

        debug!(spec = %name, revision = record.revision, "Stored desired state");
        self.notifier.notify(&name);
        Ok(PutResult {
            revision: record.revision,
            changed: true,
        })
    }

    fn get(&self, name: &ResourceName) -> Result<Option<StoredSpec>, StoreError> {
        fetch(&self.conn(), name.as_str())
    }

    fn delete(&self, name: &ResourceName) -> Result<Option<StoredSpec>, StoreError> {
        let tombstone = {
            let conn = self.conn();
            conn.execute(
                "UPDATE specs SET deleted = 1, updated_at = ?2 WHERE name = ?1 AND deleted = 0",
                params![name.as_str(), Utc::now().to_rfc3339()],
            )?;
            fetch(&conn, name.as_str())?
        };

        if tombstone.is_some() {
            self.notifier.notify(name);
        }
        Ok(tombstone)
    }

    fn list(&self) -> Result<Vec<StoredSpec>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY name"))?;
        let rows = stmt
            .query_map([], SpecRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(SpecRow::into_stored).collect()
    }

    fn purge(&self, name: &ResourceName) -> Result<bool, StoreError> {
        let removed = self.conn().execute(
            "DELETE FROM specs WHERE name = ?1 AND deleted = 1",
            params![name.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceName> {
        self.notifier.subscribe()
    }
}
