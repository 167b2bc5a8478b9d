//! Change application.
//!
//! Executes the create/update decided by classification against the target
//! side. Live applies commit the entity write, the sync-state upsert, and
//! the audit entry as one store transaction; pushes additionally tag the
//! outgoing payload with the run's correlation marker. A dry run computes
//! the identical outcome and mutates nothing anywhere.

use crate::client::LedgerClient;
use crate::error::{SyncError, SyncResult};
use crate::guard::marker_for;
use crate::hash::change_hash;
use crate::ownership::FieldOwnershipResolver;
use crate::SYNC_MARKER_FIELD;
use chrono::Utc;
use ledgerlink_store::{ApplyUnit, LocalStore};
use ledgerlink_types::{
    ConflictDetail, EntityKind, EntityRecord, LogStatus, RemoteEntity, SyncLogEntry,
    SyncOperation, SyncOrigin, SyncState, SyncStatus,
};
use std::sync::Arc;
use tracing::warn;

/// The two views and bookkeeping row for one entity being reconciled.
#[derive(Clone, Debug)]
pub struct EntityPair {
    pub kind: EntityKind,
    pub local: Option<EntityRecord>,
    pub remote: Option<RemoteEntity>,
    pub state: Option<SyncState>,
}

impl EntityPair {
    /// The remote id from whichever part of the pair knows it.
    pub fn remote_id(&self) -> Option<&str> {
        self.state
            .as_ref()
            .and_then(|s| s.remote_id.as_deref())
            .or(self.remote.as_ref().map(|r| r.id.as_str()))
            .or(self.local.as_ref().and_then(|l| l.remote_id.as_deref()))
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local
            .as_ref()
            .map(|l| l.local_id.as_str())
            .or(self.state.as_ref().map(|s| s.local_id.as_str()))
    }
}

/// Per-run parameters threaded through every apply.
#[derive(Clone, Copy, Debug)]
pub struct ApplyContext<'a> {
    pub correlation_id: &'a str,
    pub user_id: Option<&'a str>,
    pub dry_run: bool,
}

/// What one apply did (or would have done, under dry run).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created { remote_id: Option<String> },
    Updated { remote_id: Option<String> },
    Skipped,
}

/// Performs creates/updates against the local store or the remote ledger.
pub struct ChangeApplier {
    store: LocalStore,
    client: Arc<dyn LedgerClient>,
}

impl ChangeApplier {
    pub fn new(store: LocalStore, client: Arc<dyn LedgerClient>) -> Self {
        Self { store, client }
    }

    /// Pushes the local version to the remote ledger.
    pub async fn push(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        local_hash: &str,
    ) -> SyncResult<ApplyOutcome> {
        let local = pair
            .local
            .as_ref()
            .ok_or_else(|| SyncError::Validation("push without a local record".to_string()))?;

        let mut payload = FieldOwnershipResolver::mask_for_push(pair.kind, &local.data);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                SYNC_MARKER_FIELD.to_string(),
                serde_json::Value::String(marker_for(ctx.correlation_id)),
            );
        }

        let existing_remote_id = pair.remote_id().map(|s| s.to_string());
        if ctx.dry_run {
            return Ok(match existing_remote_id {
                Some(id) => ApplyOutcome::Updated { remote_id: Some(id) },
                None => ApplyOutcome::Created { remote_id: None },
            });
        }

        let operation;
        let remote_id;
        let result = match &existing_remote_id {
            Some(id) => {
                operation = SyncOperation::Update;
                self.client
                    .update_entity(pair.kind, id, &payload)
                    .await
                    .map(|()| id.clone())
            }
            None => {
                operation = SyncOperation::Create;
                self.client.create_entity(pair.kind, &payload).await
            }
        };
        match result {
            Ok(id) => remote_id = id,
            Err(e) => {
                self.record_failure(ctx, pair, operation, SyncOrigin::Local, &e);
                return Err(e);
            }
        }

        // The pushed authored content is now the remote's authored content,
        // so both fingerprints converge on the local hash.
        let now = Utc::now();
        let state = self.next_state(
            pair,
            local.local_id.clone(),
            Some(remote_id.clone()),
            Some(local_hash.to_string()),
            Some(local_hash.to_string()),
            ctx.correlation_id,
            now,
        );

        // Link the local row to a newly created remote id.
        let entity = (local.remote_id.as_deref() != Some(remote_id.as_str())).then(|| {
            let mut linked = local.clone();
            linked.remote_id = Some(remote_id.clone());
            linked
        });

        let log = SyncLogEntry {
            id: 0,
            correlation_id: ctx.correlation_id.to_string(),
            kind: pair.kind,
            entity_id: local.local_id.clone(),
            remote_id: Some(remote_id.clone()),
            operation,
            origin: SyncOrigin::Local,
            before: pair.remote.as_ref().map(|r| r.data.clone()),
            after: Some(payload),
            change_hash: Some(local_hash.to_string()),
            status: LogStatus::Success,
            error_message: None,
            user_id: ctx.user_id.map(|s| s.to_string()),
            timestamp: now,
        };

        self.store.commit_apply(ApplyUnit {
            entity: entity.as_ref(),
            state: &state,
            log: &log,
        })?;

        Ok(match operation {
            SyncOperation::Create => ApplyOutcome::Created {
                remote_id: Some(remote_id),
            },
            _ => ApplyOutcome::Updated {
                remote_id: Some(remote_id),
            },
        })
    }

    /// Pulls the remote version into the local store, preserving local-owned
    /// fields.
    pub async fn pull(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        remote_hash: &str,
    ) -> SyncResult<ApplyOutcome> {
        let remote = pair
            .remote
            .as_ref()
            .ok_or_else(|| SyncError::Validation("pull without a remote record".to_string()))?;

        let operation = if pair.local.is_some() {
            SyncOperation::Update
        } else {
            SyncOperation::Create
        };
        if ctx.dry_run {
            return Ok(match operation {
                SyncOperation::Create => ApplyOutcome::Created {
                    remote_id: Some(remote.id.clone()),
                },
                _ => ApplyOutcome::Updated {
                    remote_id: Some(remote.id.clone()),
                },
            });
        }

        // The pull direction means the local authored content is unchanged
        // since the last reconciliation, so the remote side wins shared
        // fields outright.
        let merged = FieldOwnershipResolver::merge_pull(
            pair.kind,
            pair.local.as_ref().map(|l| &l.data),
            &remote.data,
            None,
            remote.updated_at,
        );

        let local_id = pair
            .local_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();

        let entity = EntityRecord {
            kind: pair.kind,
            local_id: local_id.clone(),
            remote_id: Some(remote.id.clone()),
            data: merged.clone(),
            updated_at: now,
        };

        let state = self.next_state(
            pair,
            local_id.clone(),
            Some(remote.id.clone()),
            Some(change_hash(pair.kind, &merged)),
            Some(remote_hash.to_string()),
            ctx.correlation_id,
            now,
        );

        let log = SyncLogEntry {
            id: 0,
            correlation_id: ctx.correlation_id.to_string(),
            kind: pair.kind,
            entity_id: local_id,
            remote_id: Some(remote.id.clone()),
            operation,
            origin: SyncOrigin::Remote,
            before: pair.local.as_ref().map(|l| l.data.clone()),
            after: Some(merged),
            change_hash: Some(remote_hash.to_string()),
            status: LogStatus::Success,
            error_message: None,
            user_id: ctx.user_id.map(|s| s.to_string()),
            timestamp: now,
        };

        self.store.commit_apply(ApplyUnit {
            entity: Some(&entity),
            state: &state,
            log: &log,
        })?;

        Ok(match operation {
            SyncOperation::Create => ApplyOutcome::Created {
                remote_id: Some(remote.id.clone()),
            },
            _ => ApplyOutcome::Updated {
                remote_id: Some(remote.id.clone()),
            },
        })
    }

    /// Marks an entity conflicted. Neither store is mutated beyond the
    /// bookkeeping row; the last-known fingerprints stay as they were.
    pub fn record_conflict(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        detail: &ConflictDetail,
    ) -> SyncResult<()> {
        if ctx.dry_run {
            return Ok(());
        }
        let local_id = pair.local_id().map(|s| s.to_string()).ok_or_else(|| {
            SyncError::Validation("conflict without a local record".to_string())
        })?;
        let now = Utc::now();

        let mut state = self.next_state(
            pair,
            local_id.clone(),
            pair.remote_id().map(|s| s.to_string()),
            pair.state.as_ref().and_then(|s| s.last_local_hash.clone()),
            pair.state.as_ref().and_then(|s| s.last_remote_hash.clone()),
            ctx.correlation_id,
            now,
        );
        state.status = SyncStatus::Conflict;
        state.conflict_data = Some(serde_json::to_value(detail)?);

        let log = SyncLogEntry {
            id: 0,
            correlation_id: ctx.correlation_id.to_string(),
            kind: pair.kind,
            entity_id: local_id,
            remote_id: pair.remote_id().map(|s| s.to_string()),
            operation: SyncOperation::ConflictDetected,
            origin: SyncOrigin::Remote,
            before: pair.local.as_ref().map(|l| l.data.clone()),
            after: pair.remote.as_ref().map(|r| r.data.clone()),
            change_hash: None,
            status: LogStatus::Success,
            error_message: None,
            user_id: ctx.user_id.map(|s| s.to_string()),
            timestamp: now,
        };

        self.store.commit_apply(ApplyUnit {
            entity: None,
            state: &state,
            log: &log,
        })?;
        Ok(())
    }

    /// Advances the stored fingerprints without touching either side's data.
    /// Used when a pair needs no apply but its baseline is stale: first
    /// sighting of already-identical records, or a suppressed self-echo.
    pub fn refresh_baseline(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        local_hash: Option<&str>,
        remote_hash: Option<&str>,
    ) -> SyncResult<()> {
        if ctx.dry_run {
            return Ok(());
        }
        let local_id = pair.local_id().map(|s| s.to_string()).ok_or_else(|| {
            SyncError::Validation("baseline refresh without a local record".to_string())
        })?;
        let now = Utc::now();

        let state = self.next_state(
            pair,
            local_id.clone(),
            pair.remote_id().map(|s| s.to_string()),
            local_hash.map(|s| s.to_string()),
            remote_hash.map(|s| s.to_string()),
            ctx.correlation_id,
            now,
        );

        let log = SyncLogEntry {
            id: 0,
            correlation_id: ctx.correlation_id.to_string(),
            kind: pair.kind,
            entity_id: local_id,
            remote_id: pair.remote_id().map(|s| s.to_string()),
            operation: SyncOperation::Skip,
            origin: SyncOrigin::Remote,
            before: None,
            after: None,
            change_hash: remote_hash.map(|s| s.to_string()),
            status: LogStatus::Success,
            error_message: None,
            user_id: ctx.user_id.map(|s| s.to_string()),
            timestamp: now,
        };

        self.store.commit_apply(ApplyUnit {
            entity: None,
            state: &state,
            log: &log,
        })?;
        Ok(())
    }

    /// Builds the successor sync-state row, preserving creation time and
    /// clearing any conflict payload.
    #[allow(clippy::too_many_arguments)]
    fn next_state(
        &self,
        pair: &EntityPair,
        local_id: String,
        remote_id: Option<String>,
        last_local_hash: Option<String>,
        last_remote_hash: Option<String>,
        correlation_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> SyncState {
        SyncState {
            kind: pair.kind,
            local_id,
            remote_id,
            status: SyncStatus::Active,
            last_local_hash,
            last_remote_hash,
            correlation_id: correlation_id.to_string(),
            conflict_data: None,
            created_at: pair.state.as_ref().map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        }
    }

    /// Best-effort failure entry so the audit trail records the attempt.
    fn record_failure(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        operation: SyncOperation,
        origin: SyncOrigin,
        error: &SyncError,
    ) {
        let entry = SyncLogEntry {
            id: 0,
            correlation_id: ctx.correlation_id.to_string(),
            kind: pair.kind,
            entity_id: pair.local_id().unwrap_or("unknown").to_string(),
            remote_id: pair.remote_id().map(|s| s.to_string()),
            operation,
            origin,
            before: None,
            after: None,
            change_hash: None,
            status: LogStatus::Failed,
            error_message: Some(error.to_string()),
            user_id: ctx.user_id.map(|s| s.to_string()),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&entry) {
            warn!("failed to record audit entry for failed apply: {e}");
        }
    }
}
