//! Canonical change fingerprints and action classification.
//!
//! A fingerprint is the SHA-256 of the canonical (recursively key-sorted)
//! JSON of an entity's hashed fields, the fields either side authors.
//! Comparing current fingerprints against the last reconciled ones yields
//! the action for an entity pair.

use crate::ownership::FieldOwnershipResolver;
use chrono::Utc;
use ledgerlink_types::{ConflictDetail, EntityKind, FieldDiff};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// What reconciliation should do with an entity pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    NoOp,
    Push,
    Pull,
    Conflict,
}

/// Computes the change fingerprint for one side's view of an entity.
pub fn change_hash(kind: EntityKind, data: &Value) -> String {
    let canonical = canonicalize(kind, data);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical JSON over the hashed-field subset: top-level fields filtered by
/// ownership, all object keys sorted recursively.
fn canonicalize(kind: EntityKind, data: &Value) -> String {
    let filtered: BTreeMap<&str, &Value> = match data.as_object() {
        Some(obj) => obj
            .iter()
            .filter(|(k, _)| FieldOwnershipResolver::is_hashed_field(kind, k))
            .map(|(k, v)| (k.as_str(), v))
            .collect(),
        None => BTreeMap::new(),
    };

    let mut out = String::from("{");
    let mut first = true;
    for (k, v) in filtered {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&format!("{:?}:", k));
        write_canonical(v, &mut out);
    }
    out.push('}');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(obj) => {
            let sorted: BTreeMap<&String, &Value> = obj.iter().collect();
            out.push('{');
            let mut first = true;
            for (k, v) in sorted {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&format!("{k:?}:"));
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            let mut first = true;
            for v in items {
                if !first {
                    out.push(',');
                }
                first = false;
                write_canonical(v, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Classifies an entity pair against the last reconciled fingerprints.
///
/// A side with no record at all counts as unchanged; when only one side has
/// a record the direction is forced. When both sides moved but ended up with
/// identical content, nothing needs applying.
pub fn classify(
    local_hash: Option<&str>,
    remote_hash: Option<&str>,
    last_local_hash: Option<&str>,
    last_remote_hash: Option<&str>,
) -> SyncAction {
    match (local_hash, remote_hash) {
        (None, None) => SyncAction::NoOp,
        (Some(_), None) => SyncAction::Push,
        (None, Some(_)) => SyncAction::Pull,
        (Some(local), Some(remote)) => {
            let local_changed = last_local_hash != Some(local);
            let remote_changed = last_remote_hash != Some(remote);
            match (local_changed, remote_changed) {
                (false, false) => SyncAction::NoOp,
                (true, false) => SyncAction::Push,
                (false, true) => SyncAction::Pull,
                (true, true) => {
                    if local == remote {
                        // Convergent edits: both moved to the same content.
                        SyncAction::NoOp
                    } else {
                        SyncAction::Conflict
                    }
                }
            }
        }
    }
}

/// Builds the field-level diff for a conflicted pair, restricted to the
/// hashed fields (computed outputs cannot conflict by construction).
pub fn conflict_detail(
    kind: EntityKind,
    local_id: &str,
    remote_id: Option<&str>,
    local_data: &Value,
    remote_data: &Value,
) -> ConflictDetail {
    let empty = serde_json::Map::new();
    let local_obj = local_data.as_object().unwrap_or(&empty);
    let remote_obj = remote_data.as_object().unwrap_or(&empty);

    let mut field_names: Vec<&str> = local_obj
        .keys()
        .chain(remote_obj.keys())
        .map(|k| k.as_str())
        .filter(|k| FieldOwnershipResolver::is_hashed_field(kind, k))
        .collect();
    field_names.sort_unstable();
    field_names.dedup();

    let fields = field_names
        .into_iter()
        .filter(|name| local_obj.get(*name) != remote_obj.get(*name))
        .map(|name| FieldDiff {
            field: name.to_string(),
            local: local_obj.get(name).cloned(),
            remote: remote_obj.get(name).cloned(),
        })
        .collect();

    ConflictDetail {
        kind,
        local_id: local_id.to_string(),
        remote_id: remote_id.map(|s| s.to_string()),
        fields,
        local_snapshot: local_data.clone(),
        remote_snapshot: remote_data.clone(),
        detected_at: Utc::now(),
    }
}
