//! The atomic apply unit.
//!
//! Every live apply commits three writes together: the business entity (when
//! the local side changes), the sync-state upsert, and the audit-log append.
//! They share one transaction so a crash between them cannot leave the state
//! updated without the matching audit row, or vice versa.

use crate::entity_store::upsert_entity_tx;
use crate::error::StoreResult;
use crate::sync_log_store::append_log_tx;
use crate::sync_state_store::upsert_state_tx;
use crate::LocalStore;
use ledgerlink_types::{EntityRecord, SyncLogEntry, SyncState};

/// Everything committed by one apply.
pub struct ApplyUnit<'a> {
    /// Local entity write; `None` when only the remote side changed content
    /// (push) and the local row is untouched.
    pub entity: Option<&'a EntityRecord>,
    pub state: &'a SyncState,
    pub log: &'a SyncLogEntry,
}

impl LocalStore {
    /// Commits an apply unit in one transaction and returns the audit row id.
    pub fn commit_apply(&self, unit: ApplyUnit<'_>) -> StoreResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if let Some(entity) = unit.entity {
            upsert_entity_tx(&tx, entity)?;
        }
        upsert_state_tx(&tx, unit.state)?;
        let log_id = append_log_tx(&tx, unit.log)?;
        tx.commit()?;
        Ok(log_id)
    }
}
