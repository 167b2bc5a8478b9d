//! SQLite storage layer for LedgerLink.
//!
//! One database holds three tables:
//! - `entities` holds business records (contacts, invoices, payments) as typed JSON
//! - `sync_state` holds one row per (kind, local_id) with last-known fingerprints
//! - `sync_log` is the append-only audit trail and the input to echo suppression
//!
//! The store exposes [`LocalStore::commit_apply`] so an entity write, its
//! sync-state upsert, and the matching audit entry land in a single
//! transaction, so a crash cannot leave state updated without the audit row.

mod apply;
mod entity_store;
mod error;
mod sync_log_store;
mod sync_state_store;

pub use apply::ApplyUnit;
pub use error::{StoreError, StoreResult};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Handle to the LedgerLink database.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Opens or creates the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; nothing to salvage.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn fmt_ts(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn initialize_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            kind        TEXT NOT NULL,
            local_id    TEXT NOT NULL,
            remote_id   TEXT,
            data_json   TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (kind, local_id)
        );
        CREATE INDEX IF NOT EXISTS idx_entities_remote
            ON entities (kind, remote_id);

        CREATE TABLE IF NOT EXISTS sync_state (
            kind             TEXT NOT NULL,
            local_id         TEXT NOT NULL,
            remote_id        TEXT,
            status           TEXT NOT NULL,
            last_local_hash  TEXT,
            last_remote_hash TEXT,
            correlation_id   TEXT NOT NULL,
            conflict_json    TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            PRIMARY KEY (kind, local_id)
        );
        CREATE INDEX IF NOT EXISTS idx_sync_state_status
            ON sync_state (status);

        CREATE TABLE IF NOT EXISTS sync_log (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            correlation_id TEXT NOT NULL,
            kind           TEXT NOT NULL,
            entity_id      TEXT NOT NULL,
            remote_id      TEXT,
            operation      TEXT NOT NULL,
            origin         TEXT NOT NULL,
            before_json    TEXT,
            after_json     TEXT,
            change_hash    TEXT,
            status         TEXT NOT NULL,
            error_message  TEXT,
            user_id        TEXT,
            timestamp      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_log_correlation
            ON sync_log (correlation_id);
        CREATE INDEX IF NOT EXISTS idx_sync_log_timestamp
            ON sync_log (timestamp);
        "#,
    )?;
    Ok(())
}
