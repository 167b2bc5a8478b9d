//! Sync-state persistence: one row per (kind, local_id) tracking the last
//! reconciled fingerprints of both sides and conflict status.

use crate::error::{StoreError, StoreResult};
use crate::{fmt_ts, parse_ts, LocalStore};
use ledgerlink_types::{EntityKind, SyncState, SyncStatus};
use rusqlite::{params, Connection, Row};

type RawState = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
);

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<RawState> {
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
    ))
}

fn decode_state(raw: RawState) -> StoreResult<SyncState> {
    let (kind, local_id, remote_id, status, llh, lrh, correlation_id, conflict, created, updated) =
        raw;
    let kind = EntityKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown entity kind {kind:?}")))?;
    let status = SyncStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown sync status {status:?}")))?;
    let conflict_data = match conflict {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };
    Ok(SyncState {
        kind,
        local_id,
        remote_id,
        status,
        last_local_hash: llh,
        last_remote_hash: lrh,
        correlation_id,
        conflict_data,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

const SELECT_COLS: &str = "kind, local_id, remote_id, status, last_local_hash, \
                           last_remote_hash, correlation_id, conflict_json, \
                           created_at, updated_at";

pub(crate) fn upsert_state_tx(conn: &Connection, state: &SyncState) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_state (kind, local_id, remote_id, status, last_local_hash,
                                 last_remote_hash, correlation_id, conflict_json,
                                 created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (kind, local_id) DO UPDATE SET
             remote_id = excluded.remote_id,
             status = excluded.status,
             last_local_hash = excluded.last_local_hash,
             last_remote_hash = excluded.last_remote_hash,
             correlation_id = excluded.correlation_id,
             conflict_json = excluded.conflict_json,
             updated_at = excluded.updated_at",
        params![
            state.kind.as_str(),
            state.local_id,
            state.remote_id,
            state.status.as_str(),
            state.last_local_hash,
            state.last_remote_hash,
            state.correlation_id,
            state
                .conflict_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            fmt_ts(&state.created_at),
            fmt_ts(&state.updated_at),
        ],
    )?;
    Ok(())
}

impl LocalStore {
    /// Inserts or replaces a sync-state row.
    pub fn upsert_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        let conn = self.lock();
        upsert_state_tx(&conn, state)
    }

    /// Fetches the sync state for an entity, if one exists.
    pub fn get_sync_state(
        &self,
        kind: EntityKind,
        local_id: &str,
    ) -> StoreResult<Option<SyncState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM sync_state WHERE kind = ?1 AND local_id = ?2"
        ))?;
        let mut rows = stmt.query_map(params![kind.as_str(), local_id], state_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_state(raw?)?)),
            None => Ok(None),
        }
    }

    /// Fetches the sync state linked to a given remote id.
    pub fn get_sync_state_by_remote_id(
        &self,
        kind: EntityKind,
        remote_id: &str,
    ) -> StoreResult<Option<SyncState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM sync_state WHERE kind = ?1 AND remote_id = ?2"
        ))?;
        let mut rows = stmt.query_map(params![kind.as_str(), remote_id], state_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_state(raw?)?)),
            None => Ok(None),
        }
    }

    /// Lists all entities currently in conflict.
    pub fn list_conflicts(&self) -> StoreResult<Vec<SyncState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM sync_state WHERE status = 'conflict'
             ORDER BY updated_at ASC"
        ))?;
        let rows = stmt.query_map([], state_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(decode_state(raw?)?);
        }
        Ok(out)
    }
}
