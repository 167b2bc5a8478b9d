//! Append-only sync audit log.
//!
//! Entries are immutable once written. Besides being the audit trail, the
//! log is queried by echo-loop suppression: a recent local-origin entry with
//! a matching correlation id means an inbound change is our own write
//! reflected back.

use crate::error::{StoreError, StoreResult};
use crate::{fmt_ts, parse_ts, LocalStore};
use chrono::{DateTime, Utc};
use ledgerlink_types::{EntityKind, LogStatus, SyncLogEntry, SyncOperation, SyncOrigin};
use rusqlite::{params, Connection, Row};

type RawLog = (
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<RawLog> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn decode_log(raw: RawLog) -> StoreResult<SyncLogEntry> {
    let (
        id,
        correlation_id,
        kind,
        entity_id,
        remote_id,
        operation,
        origin,
        before,
        after,
        change_hash,
        status,
        error_message,
        user_id,
        timestamp,
    ) = raw;
    Ok(SyncLogEntry {
        id,
        correlation_id,
        kind: EntityKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown entity kind {kind:?}")))?,
        entity_id,
        remote_id,
        operation: SyncOperation::parse(&operation)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown operation {operation:?}")))?,
        origin: SyncOrigin::parse(&origin)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown origin {origin:?}")))?,
        before: before.map(|s| serde_json::from_str(&s)).transpose()?,
        after: after.map(|s| serde_json::from_str(&s)).transpose()?,
        change_hash,
        status: LogStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log status {status:?}")))?,
        error_message,
        user_id,
        timestamp: parse_ts(&timestamp)?,
    })
}

const SELECT_COLS: &str = "id, correlation_id, kind, entity_id, remote_id, operation, \
                           origin, before_json, after_json, change_hash, status, \
                           error_message, user_id, timestamp";

pub(crate) fn append_log_tx(conn: &Connection, entry: &SyncLogEntry) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO sync_log (correlation_id, kind, entity_id, remote_id, operation,
                               origin, before_json, after_json, change_hash, status,
                               error_message, user_id, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            entry.correlation_id,
            entry.kind.as_str(),
            entry.entity_id,
            entry.remote_id,
            entry.operation.as_str(),
            entry.origin.as_str(),
            entry.before.as_ref().map(serde_json::to_string).transpose()?,
            entry.after.as_ref().map(serde_json::to_string).transpose()?,
            entry.change_hash,
            entry.status.as_str(),
            entry.error_message,
            entry.user_id,
            fmt_ts(&entry.timestamp),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl LocalStore {
    /// Appends one audit entry, returning its row id.
    pub fn append_log(&self, entry: &SyncLogEntry) -> StoreResult<i64> {
        let conn = self.lock();
        append_log_tx(&conn, entry)
    }

    /// Returns true if a successful local-origin write with the given
    /// correlation id was logged at or after `since`.
    pub fn has_recent_local_write(
        &self,
        correlation_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_log
             WHERE correlation_id = ?1
               AND origin = 'local'
               AND status = 'success'
               AND timestamp >= ?2",
            params![correlation_id, fmt_ts(&since)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Lists the audit trail for one entity, newest first.
    pub fn list_log_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> StoreResult<Vec<SyncLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM sync_log
             WHERE kind = ?1 AND entity_id = ?2
             ORDER BY id DESC"
        ))?;
        let rows = stmt.query_map(params![kind.as_str(), entity_id], log_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(decode_log(raw?)?);
        }
        Ok(out)
    }

    /// Lists the most recent audit entries, newest first.
    pub fn list_log(&self, limit: usize) -> StoreResult<Vec<SyncLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM sync_log ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], log_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(decode_log(raw?)?);
        }
        Ok(out)
    }

    /// Total number of audit entries.
    pub fn log_count(&self) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(correlation_id: &str, origin: SyncOrigin) -> SyncLogEntry {
        SyncLogEntry {
            id: 0,
            correlation_id: correlation_id.into(),
            kind: EntityKind::Contact,
            entity_id: "c-1".into(),
            remote_id: Some("r-1".into()),
            operation: SyncOperation::Update,
            origin,
            before: Some(serde_json::json!({ "name": "before" })),
            after: Some(serde_json::json!({ "name": "after" })),
            change_hash: Some("deadbeef".into()),
            status: LogStatus::Success,
            error_message: None,
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_and_read_back() {
        let store = LocalStore::open_in_memory().unwrap();
        let id = store.append_log(&entry("run-1", SyncOrigin::Local)).unwrap();
        assert!(id > 0);

        let log = store.list_log_for_entity(EntityKind::Contact, "c-1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, id);
        assert_eq!(log[0].operation, SyncOperation::Update);
        assert_eq!(log[0].after.as_ref().unwrap()["name"], "after");
    }

    #[test]
    fn recent_local_write_match_requires_origin_and_window() {
        let store = LocalStore::open_in_memory().unwrap();
        store.append_log(&entry("run-1", SyncOrigin::Local)).unwrap();
        store.append_log(&entry("run-2", SyncOrigin::Remote)).unwrap();

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert!(store.has_recent_local_write("run-1", hour_ago).unwrap());
        // Remote-origin entry never counts
        assert!(!store.has_recent_local_write("run-2", hour_ago).unwrap());
        // Outside the window
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(!store.has_recent_local_write("run-1", future).unwrap());
    }

    #[test]
    fn failed_entries_do_not_count_for_echo_suppression() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut failed = entry("run-3", SyncOrigin::Local);
        failed.status = LogStatus::Failed;
        failed.error_message = Some("remote 500".into());
        store.append_log(&failed).unwrap();

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert!(!store.has_recent_local_write("run-3", hour_ago).unwrap());
    }

    #[test]
    fn list_log_is_newest_first() {
        let store = LocalStore::open_in_memory().unwrap();
        store.append_log(&entry("run-1", SyncOrigin::Local)).unwrap();
        store.append_log(&entry("run-2", SyncOrigin::Local)).unwrap();

        let log = store.list_log(10).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].correlation_id, "run-2");
        assert_eq!(store.log_count().unwrap(), 2);
    }
}
