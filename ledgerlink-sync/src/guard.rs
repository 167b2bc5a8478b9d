//! Echo-loop suppression.
//!
//! Every push embeds a correlation marker the ledger echoes back. When a
//! pulled entity carries a marker matching a successful local-origin audit
//! entry inside the recency window, the inbound change is our own prior
//! write reflected back and must not be re-applied.

use crate::error::SyncResult;
use crate::SYNC_MARKER_FIELD;
use chrono::{Duration, Utc};
use ledgerlink_store::LocalStore;
use serde_json::Value;
use tracing::debug;

const MARKER_PREFIX: &str = "lsync:";

/// Formats the marker embedded in pushed payloads.
pub fn marker_for(correlation_id: &str) -> String {
    format!("{MARKER_PREFIX}{correlation_id}")
}

/// Extracts the correlation id from an entity payload's marker, if any.
pub fn marker_correlation_id(data: &Value) -> Option<&str> {
    data.get(SYNC_MARKER_FIELD)?
        .as_str()?
        .strip_prefix(MARKER_PREFIX)
}

/// Recognizes self-originated echoes in inbound entities.
pub struct LoopGuard {
    store: LocalStore,
    window: Duration,
}

impl LoopGuard {
    pub fn new(store: LocalStore, window_secs: i64) -> Self {
        Self {
            store,
            window: Duration::seconds(window_secs),
        }
    }

    /// Returns true if the inbound entity is an echo of our own recent write
    /// and its apply should be suppressed.
    pub fn should_skip(&self, incoming: &Value) -> SyncResult<bool> {
        let Some(correlation_id) = marker_correlation_id(incoming) else {
            return Ok(false);
        };
        let since = Utc::now() - self.window;
        let is_echo = self.store.has_recent_local_write(correlation_id, since)?;
        if is_echo {
            debug!("suppressing echo of run {correlation_id}");
        }
        Ok(is_echo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledgerlink_types::{
        EntityKind, LogStatus, SyncLogEntry, SyncOperation, SyncOrigin,
    };
    use serde_json::json;

    fn local_write(correlation_id: &str) -> SyncLogEntry {
        SyncLogEntry {
            id: 0,
            correlation_id: correlation_id.into(),
            kind: EntityKind::Contact,
            entity_id: "c-1".into(),
            remote_id: Some("r-1".into()),
            operation: SyncOperation::Update,
            origin: SyncOrigin::Local,
            before: None,
            after: None,
            change_hash: None,
            status: LogStatus::Success,
            error_message: None,
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn marker_round_trip() {
        let data = json!({ "name": "Acme", "sync_marker": marker_for("run-7") });
        assert_eq!(marker_correlation_id(&data), Some("run-7"));
        assert_eq!(marker_correlation_id(&json!({ "name": "Acme" })), None);
        assert_eq!(
            marker_correlation_id(&json!({ "sync_marker": "unrelated" })),
            None
        );
    }

    #[test]
    fn echo_of_recent_local_write_is_skipped() {
        let store = LocalStore::open_in_memory().unwrap();
        store.append_log(&local_write("run-7")).unwrap();
        let guard = LoopGuard::new(store, 3600);

        let echoed = json!({ "name": "Acme", "sync_marker": marker_for("run-7") });
        assert!(guard.should_skip(&echoed).unwrap());
    }

    #[test]
    fn foreign_marker_is_not_skipped() {
        let store = LocalStore::open_in_memory().unwrap();
        store.append_log(&local_write("run-7")).unwrap();
        let guard = LoopGuard::new(store, 3600);

        let foreign = json!({ "name": "Acme", "sync_marker": marker_for("other-run") });
        assert!(!guard.should_skip(&foreign).unwrap());
    }

    #[test]
    fn marker_outside_window_is_not_skipped() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut old = local_write("run-7");
        old.timestamp = Utc::now() - chrono::Duration::hours(48);
        store.append_log(&old).unwrap();
        let guard = LoopGuard::new(store, 3600);

        let echoed = json!({ "sync_marker": marker_for("run-7") });
        assert!(!guard.should_skip(&echoed).unwrap());
    }
}
