//! Business-entity persistence: contacts, invoices, and payments stored as
//! typed JSON rows keyed by (kind, local_id).

use crate::error::{StoreError, StoreResult};
use crate::{fmt_ts, parse_ts, LocalStore};
use chrono::{DateTime, Utc};
use ledgerlink_types::{EntityKind, EntityRecord};
use rusqlite::{params, Row};

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, Option<String>, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_entity(
    (kind, local_id, remote_id, data_json, updated_at): (String, String, Option<String>, String, String),
) -> StoreResult<EntityRecord> {
    let kind = EntityKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown entity kind {kind:?}")))?;
    Ok(EntityRecord {
        kind,
        local_id,
        remote_id,
        data: serde_json::from_str(&data_json)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

const SELECT_COLS: &str = "kind, local_id, remote_id, data_json, updated_at";

pub(crate) fn upsert_entity_tx(
    conn: &rusqlite::Connection,
    entity: &EntityRecord,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO entities (kind, local_id, remote_id, data_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (kind, local_id) DO UPDATE SET
             remote_id = excluded.remote_id,
             data_json = excluded.data_json,
             updated_at = excluded.updated_at",
        params![
            entity.kind.as_str(),
            entity.local_id,
            entity.remote_id,
            serde_json::to_string(&entity.data)?,
            fmt_ts(&entity.updated_at),
        ],
    )?;
    Ok(())
}

impl LocalStore {
    /// Inserts or replaces a business entity.
    pub fn upsert_entity(&self, entity: &EntityRecord) -> StoreResult<()> {
        let conn = self.lock();
        upsert_entity_tx(&conn, entity)
    }

    /// Fetches an entity by its local id.
    pub fn get_entity(&self, kind: EntityKind, local_id: &str) -> StoreResult<Option<EntityRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM entities WHERE kind = ?1 AND local_id = ?2"
        ))?;
        let mut rows = stmt.query_map(params![kind.as_str(), local_id], entity_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_entity(raw?)?)),
            None => Ok(None),
        }
    }

    /// Fetches an entity by the remote ledger's id, if any row is linked to it.
    pub fn get_entity_by_remote_id(
        &self,
        kind: EntityKind,
        remote_id: &str,
    ) -> StoreResult<Option<EntityRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM entities WHERE kind = ?1 AND remote_id = ?2"
        ))?;
        let mut rows = stmt.query_map(params![kind.as_str(), remote_id], entity_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_entity(raw?)?)),
            None => Ok(None),
        }
    }

    /// Lists entities of a kind, optionally only those modified since a point
    /// in time, ordered by modification time.
    pub fn list_entities(
        &self,
        kind: EntityKind,
        modified_since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<EntityRecord>> {
        let conn = self.lock();
        let mut out = Vec::new();
        match modified_since {
            Some(since) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLS} FROM entities
                     WHERE kind = ?1 AND updated_at > ?2
                     ORDER BY updated_at ASC"
                ))?;
                let rows = stmt.query_map(params![kind.as_str(), fmt_ts(&since)], entity_from_row)?;
                for raw in rows {
                    out.push(decode_entity(raw?)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLS} FROM entities WHERE kind = ?1 ORDER BY updated_at ASC"
                ))?;
                let rows = stmt.query_map(params![kind.as_str()], entity_from_row)?;
                for raw in rows {
                    out.push(decode_entity(raw?)?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn contact(local_id: &str, name: &str) -> EntityRecord {
        EntityRecord {
            kind: EntityKind::Contact,
            local_id: local_id.into(),
            remote_id: None,
            data: json!({ "name": name, "email": "a@b.example" }),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = contact("c-1", "Acme");
        store.upsert_entity(&c).unwrap();

        let got = store.get_entity(EntityKind::Contact, "c-1").unwrap().unwrap();
        assert_eq!(got.data, c.data);
        assert_eq!(got.remote_id, None);
    }

    #[test]
    fn upsert_replaces_existing() {
        let store = LocalStore::open_in_memory().unwrap();
        store.upsert_entity(&contact("c-1", "Acme")).unwrap();

        let mut updated = contact("c-1", "Acme Ltd");
        updated.remote_id = Some("r-9".into());
        store.upsert_entity(&updated).unwrap();

        let got = store.get_entity(EntityKind::Contact, "c-1").unwrap().unwrap();
        assert_eq!(got.data["name"], "Acme Ltd");
        assert_eq!(got.remote_id.as_deref(), Some("r-9"));
    }

    #[test]
    fn lookup_by_remote_id() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut c = contact("c-1", "Acme");
        c.remote_id = Some("r-1".into());
        store.upsert_entity(&c).unwrap();

        let got = store
            .get_entity_by_remote_id(EntityKind::Contact, "r-1")
            .unwrap()
            .unwrap();
        assert_eq!(got.local_id, "c-1");
        assert!(store
            .get_entity_by_remote_id(EntityKind::Contact, "r-2")
            .unwrap()
            .is_none());
    }

    #[test]
    fn list_filters_by_modified_since() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut old = contact("c-old", "Old");
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.upsert_entity(&old).unwrap();
        store.upsert_entity(&contact("c-new", "New")).unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let fresh = store
            .list_entities(EntityKind::Contact, Some(since))
            .unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].local_id, "c-new");

        let all = store.list_entities(EntityKind::Contact, None).unwrap();
        assert_eq!(all.len(), 2);
    }
}
