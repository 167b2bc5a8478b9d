//! Per-entity-type field ownership.
//!
//! Every field is owned by one side or shared. Pushes strip remote-owned
//! fields from the outgoing payload so local data can never clobber the
//! ledger's computed values; pulls preserve local-owned fields so inbound
//! data can never clobber local bookkeeping. Shared fields resolve
//! last-writer-wins by per-side modification timestamps.

use chrono::{DateTime, Utc};
use ledgerlink_types::EntityKind;
use serde_json::{Map, Value};

use crate::SYNC_MARKER_FIELD;

/// Which side of the sync is authoritative for a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldOwnership {
    LocalOwned,
    RemoteOwned,
    Shared,
}

const CONTACT_FIELDS: &[(&str, FieldOwnership)] = &[
    ("name", FieldOwnership::Shared),
    ("email", FieldOwnership::Shared),
    ("phone", FieldOwnership::Shared),
    ("address", FieldOwnership::Shared),
    ("notes", FieldOwnership::LocalOwned),
    ("account_code", FieldOwnership::LocalOwned),
    ("outstanding_balance", FieldOwnership::RemoteOwned),
    ("credit_status", FieldOwnership::RemoteOwned),
];

const INVOICE_FIELDS: &[(&str, FieldOwnership)] = &[
    ("reference", FieldOwnership::Shared),
    ("due_date", FieldOwnership::Shared),
    ("line_items", FieldOwnership::Shared),
    ("status", FieldOwnership::Shared),
    ("notes", FieldOwnership::LocalOwned),
    ("project_code", FieldOwnership::LocalOwned),
    ("sub_total", FieldOwnership::RemoteOwned),
    ("tax_total", FieldOwnership::RemoteOwned),
    ("total", FieldOwnership::RemoteOwned),
    ("amount_due", FieldOwnership::RemoteOwned),
    ("amount_paid", FieldOwnership::RemoteOwned),
];

const PAYMENT_FIELDS: &[(&str, FieldOwnership)] = &[
    ("date", FieldOwnership::Shared),
    ("amount", FieldOwnership::Shared),
    ("invoice_id", FieldOwnership::Shared),
    ("notes", FieldOwnership::LocalOwned),
    ("reconciled", FieldOwnership::RemoteOwned),
    ("statement_line_id", FieldOwnership::RemoteOwned),
];

/// Static per-kind authority table used when merging.
pub struct FieldOwnershipResolver;

impl FieldOwnershipResolver {
    pub fn table(kind: EntityKind) -> &'static [(&'static str, FieldOwnership)] {
        match kind {
            EntityKind::Contact => CONTACT_FIELDS,
            EntityKind::Invoice => INVOICE_FIELDS,
            EntityKind::Payment => PAYMENT_FIELDS,
        }
    }

    /// Ownership of one field. Fields not in the table are shared; the
    /// correlation marker is passed through untouched.
    pub fn ownership(kind: EntityKind, field: &str) -> FieldOwnership {
        Self::table(kind)
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, o)| *o)
            .unwrap_or(FieldOwnership::Shared)
    }

    /// The fields whose content participates in change fingerprints: every
    /// field either side authors. Remote-owned computed outputs are excluded
    /// so a ledger-side recalculation never reads as a change by itself.
    pub fn is_hashed_field(kind: EntityKind, field: &str) -> bool {
        if field == SYNC_MARKER_FIELD {
            return false;
        }
        Self::ownership(kind, field) != FieldOwnership::RemoteOwned
    }

    /// Filters an outgoing push payload: remote-owned fields are never sent.
    pub fn mask_for_push(kind: EntityKind, payload: &Value) -> Value {
        let Some(obj) = payload.as_object() else {
            return payload.clone();
        };
        let filtered: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| {
                *k == SYNC_MARKER_FIELD
                    || Self::ownership(kind, k) != FieldOwnership::RemoteOwned
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(filtered)
    }

    /// Merges an inbound remote payload over the local one.
    ///
    /// Local-owned fields keep their local values; remote-owned fields always
    /// take the remote values; shared fields follow last-writer-wins by the
    /// two modification timestamps.
    pub fn merge_pull(
        kind: EntityKind,
        local: Option<&Value>,
        remote: &Value,
        local_updated: Option<DateTime<Utc>>,
        remote_updated: Option<DateTime<Utc>>,
    ) -> Value {
        let Some(remote_obj) = remote.as_object() else {
            return remote.clone();
        };
        let local_obj = local.and_then(|v| v.as_object());

        // Shared fields: local wins only when it is strictly newer.
        let local_wins_shared = match (local_updated, remote_updated) {
            (Some(l), Some(r)) => l > r,
            _ => false,
        };

        let mut merged = remote_obj.clone();
        if let Some(local_obj) = local_obj {
            for (k, v) in local_obj {
                match Self::ownership(kind, k) {
                    FieldOwnership::LocalOwned => {
                        merged.insert(k.clone(), v.clone());
                    }
                    FieldOwnership::Shared => {
                        if local_wins_shared || !merged.contains_key(k) {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                    FieldOwnership::RemoteOwned => {}
                }
            }
        }
        Value::Object(merged)
    }
}
