//! Run coordination.
//!
//! A run walks each entity kind in the requested direction: the pull pass
//! pages through the remote listing and reconciles each remote entity
//! against its local pair, the push pass walks locally modified entities
//! that the pull pass did not already settle. Per-entity failures are
//! recorded and the run continues; authentication and connection failures
//! abort it. Overlapping runs over the same integration, kind and direction
//! are rejected while the first holds the scope lock.

use crate::applier::{ApplyContext, ApplyOutcome, ChangeApplier, EntityPair};
use crate::client::LedgerClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::guard::LoopGuard;
use crate::hash::{change_hash, classify, conflict_detail, SyncAction};
use crate::progress::ProgressBus;
use crate::token::TokenRefreshService;
use chrono::Utc;
use ledgerlink_store::LocalStore;
use ledgerlink_types::{
    ConflictDetail, ConflictResolution, EntityError, EntityKind, LogStatus, ProgressEvent,
    ProgressPhase, ProgressState, RunOutcome, SyncLogEntry, SyncOperation, SyncOptions,
    SyncOrigin, SyncReport, SyncState, SyncStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scope keys held for the duration of a run, released on drop.
struct RunScopeGuard {
    locks: Arc<Mutex<HashSet<String>>>,
    keys: Vec<String>,
}

impl Drop for RunScopeGuard {
    fn drop(&mut self) {
        let mut held = match self.locks.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            held.remove(key);
        }
    }
}

enum PassEnd {
    Done,
    Aborted,
}

/// Coordinates full sync runs and conflict resolution.
pub struct SyncOrchestrator {
    store: LocalStore,
    client: Arc<dyn LedgerClient>,
    tokens: Arc<TokenRefreshService>,
    applier: ChangeApplier,
    guard: LoopGuard,
    progress: Arc<ProgressBus>,
    config: SyncConfig,
    run_locks: Arc<Mutex<HashSet<String>>>,
    abort: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        client: Arc<dyn LedgerClient>,
        tokens: Arc<TokenRefreshService>,
        config: SyncConfig,
    ) -> Self {
        let applier = ChangeApplier::new(store.clone(), client.clone());
        let guard = LoopGuard::new(store.clone(), config.loop_guard_window_secs);
        Self {
            store,
            client,
            tokens,
            applier,
            guard,
            progress: Arc::new(ProgressBus::default()),
            config,
            run_locks: Arc::new(Mutex::new(HashSet::new())),
            abort: AtomicBool::new(false),
        }
    }

    pub fn progress_bus(&self) -> Arc<ProgressBus> {
        self.progress.clone()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Requests a cooperative stop; the running pass checks the flag between
    /// entities.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Currently conflicted entities with their field-level diffs.
    pub fn conflicts(&self) -> SyncResult<Vec<ConflictDetail>> {
        let mut details = Vec::new();
        for state in self.store.list_conflicts()? {
            if let Some(data) = state.conflict_data {
                details.push(serde_json::from_value(data)?);
            }
        }
        Ok(details)
    }

    /// Runs one sync according to the options. Returns
    /// `SyncError::RunInProgress` when an overlapping run holds the scope.
    /// Authentication failure before or during the run aborts it and is
    /// reported in the returned `SyncReport` rather than as an error.
    pub async fn sync(
        &self,
        options: SyncOptions,
        user_id: Option<String>,
    ) -> SyncResult<SyncReport> {
        let correlation_id = Uuid::new_v4().to_string();
        let kinds: Vec<EntityKind> = match options.kinds.clone() {
            Some(kinds) if !kinds.is_empty() => kinds,
            _ => EntityKind::ALL.to_vec(),
        };

        let _scope = self.acquire_scope(&kinds, &options)?;
        self.abort.store(false, Ordering::SeqCst);

        let mut report = SyncReport::empty(correlation_id.clone());
        self.progress.publish(ProgressEvent::RunStarted {
            correlation_id: correlation_id.clone(),
            direction: options.direction,
            dry_run: options.dry_run,
        });
        info!(
            correlation_id = %correlation_id,
            direction = %options.direction,
            dry_run = options.dry_run,
            "sync run started"
        );

        // A run cannot start without a usable credential.
        let token_result = if options.force_refresh {
            self.tokens.force_refresh().await
        } else {
            self.tokens.ensure_valid().await
        };
        if let Err(e) = token_result {
            warn!("sync run aborted before start: {e}");
            report.success = false;
            report.outcome = RunOutcome::Aborted;
            report.errors.push(EntityError {
                kind: kinds[0],
                entity_id: String::new(),
                message: e.to_string(),
            });
            self.finish(&correlation_id, &report);
            return Ok(report);
        }

        let ctx = ApplyContext {
            correlation_id: &correlation_id,
            user_id: user_id.as_deref(),
            dry_run: options.dry_run,
        };

        'kinds: for kind in &kinds {
            self.publish_progress(*kind, ProgressPhase::Listing, 0, 0, None);
            // Local ids settled by the pull pass; the push pass skips them.
            let mut reconciled: HashSet<String> = HashSet::new();

            if options.direction.pulls() {
                match self
                    .pull_pass(ctx, *kind, &options, &mut report, &mut reconciled)
                    .await
                {
                    Ok(PassEnd::Done) => {}
                    Ok(PassEnd::Aborted) => {
                        report.outcome = RunOutcome::Aborted;
                        self.publish_progress(*kind, ProgressPhase::Failed, 0, 0, None);
                        break 'kinds;
                    }
                    Err(e) => {
                        self.fail_kind(*kind, &e, &mut report);
                        if e.is_fatal() {
                            report.outcome = RunOutcome::Aborted;
                            break 'kinds;
                        }
                        continue 'kinds;
                    }
                }
            }

            if options.direction.pushes() {
                match self
                    .push_pass(ctx, *kind, &options, &mut report, &reconciled)
                    .await
                {
                    Ok(PassEnd::Done) => {}
                    Ok(PassEnd::Aborted) => {
                        report.outcome = RunOutcome::Aborted;
                        self.publish_progress(*kind, ProgressPhase::Failed, 0, 0, None);
                        break 'kinds;
                    }
                    Err(e) => {
                        self.fail_kind(*kind, &e, &mut report);
                        if e.is_fatal() {
                            report.outcome = RunOutcome::Aborted;
                            break 'kinds;
                        }
                        continue 'kinds;
                    }
                }
            }

            self.publish_progress(*kind, ProgressPhase::Completed, 0, 0, None);
        }

        if report.outcome != RunOutcome::Aborted && !report.errors.is_empty() {
            report.outcome = RunOutcome::PartiallyFailed;
        }
        report.success = report.outcome == RunOutcome::Completed;
        self.finish(&correlation_id, &report);
        Ok(report)
    }

    /// Resolves a conflicted entity and returns its refreshed sync state.
    pub async fn resolve_conflict(
        &self,
        kind: EntityKind,
        local_id: &str,
        resolution: ConflictResolution,
        notes: Option<String>,
        user_id: Option<String>,
    ) -> SyncResult<SyncState> {
        let state = self
            .store
            .get_sync_state(kind, local_id)?
            .ok_or_else(|| SyncError::NotFound(format!("no sync state for {kind} {local_id}")))?;
        if state.status != SyncStatus::Conflict {
            return Err(SyncError::Validation(format!(
                "{kind} {local_id} is not conflicted"
            )));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let ctx = ApplyContext {
            correlation_id: &correlation_id,
            user_id: user_id.as_deref(),
            dry_run: false,
        };
        let local = self.store.get_entity(kind, local_id)?;
        let remote_id = state.remote_id.clone();

        let origin = match resolution {
            ConflictResolution::UseLocal | ConflictResolution::Manual => SyncOrigin::Local,
            ConflictResolution::UseRemote => SyncOrigin::Remote,
        };

        match resolution {
            ConflictResolution::UseLocal => {
                // Re-push the local version; remote-owned fields are masked
                // off as usual.
                let record = local.clone().ok_or_else(|| {
                    SyncError::NotFound(format!("no local record for {kind} {local_id}"))
                })?;
                let local_hash = change_hash(kind, &record.data);
                let pair = EntityPair {
                    kind,
                    local: Some(record),
                    remote: None,
                    state: Some(state),
                };
                self.applier.push(ctx, &pair, &local_hash).await?;
            }
            ConflictResolution::UseRemote => {
                let rid = remote_id.clone().ok_or_else(|| {
                    SyncError::Validation(format!("{kind} {local_id} has no remote pair"))
                })?;
                let remote = self.client.get_entity(kind, &rid).await?;
                let remote_hash = change_hash(kind, &remote.data);
                let pair = EntityPair {
                    kind,
                    local,
                    remote: Some(remote),
                    state: Some(state),
                };
                self.applier.pull(ctx, &pair, &remote_hash).await?;
            }
            ConflictResolution::Manual => {
                // The caller already edited the local record into its final
                // form; clear the conflict and rebaseline both fingerprints.
                let record = local.ok_or_else(|| {
                    SyncError::NotFound(format!("no local record for {kind} {local_id}"))
                })?;
                let local_hash = change_hash(kind, &record.data);
                let remote = match &remote_id {
                    Some(rid) => Some(self.client.get_entity(kind, rid).await?),
                    None => None,
                };
                let remote_hash = remote.as_ref().map(|r| change_hash(kind, &r.data));
                let pair = EntityPair {
                    kind,
                    local: Some(record),
                    remote,
                    state: Some(state),
                };
                self.applier
                    .refresh_baseline(ctx, &pair, Some(&local_hash), remote_hash.as_deref())?;
            }
        }

        let resolution_log = SyncLogEntry {
            id: 0,
            correlation_id,
            kind,
            entity_id: local_id.to_string(),
            remote_id,
            operation: SyncOperation::ConflictResolved,
            origin,
            before: None,
            after: Some(serde_json::json!({
                "resolution": resolution,
                "notes": notes,
            })),
            change_hash: None,
            status: LogStatus::Success,
            error_message: None,
            user_id,
            timestamp: Utc::now(),
        };
        self.store.append_log(&resolution_log)?;

        self.store
            .get_sync_state(kind, local_id)?
            .ok_or_else(|| SyncError::NotFound(format!("no sync state for {kind} {local_id}")))
    }

    fn acquire_scope(
        &self,
        kinds: &[EntityKind],
        options: &SyncOptions,
    ) -> SyncResult<RunScopeGuard> {
        // A bidirectional run covers the same scope as its component
        // directions, so it holds both keys per kind.
        let mut keys: Vec<String> = Vec::new();
        for kind in kinds {
            if options.direction.pulls() {
                keys.push(format!("{}:{}:pull", self.config.integration_id, kind));
            }
            if options.direction.pushes() {
                keys.push(format!("{}:{}:push", self.config.integration_id, kind));
            }
        }
        let mut held = match self.run_locks.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(key) = keys.iter().find(|k| held.contains(*k)) {
            return Err(SyncError::RunInProgress(key.clone()));
        }
        for key in &keys {
            held.insert(key.clone());
        }
        Ok(RunScopeGuard {
            locks: self.run_locks.clone(),
            keys,
        })
    }

    async fn pull_pass(
        &self,
        ctx: ApplyContext<'_>,
        kind: EntityKind,
        options: &SyncOptions,
        report: &mut SyncReport,
        reconciled: &mut HashSet<String>,
    ) -> SyncResult<PassEnd> {
        let mut cursor: Option<String> = None;
        let mut seen = 0u64;
        let mut total = 0u64;

        loop {
            let page = {
                let mut pauses = 0u32;
                loop {
                    match self
                        .client
                        .list_entities(kind, cursor.as_deref(), options.modified_since)
                        .await
                    {
                        Ok(p) => break p,
                        Err(SyncError::RateLimited { retry_after })
                            if pauses < self.config.transient_retries =>
                        {
                            warn!("rate limited listing {kind}, pausing {retry_after:?}");
                            tokio::time::sleep(retry_after).await;
                            pauses += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            total += page.items.len() as u64;

            for remote in &page.items {
                if self.abort.load(Ordering::SeqCst) {
                    return Ok(PassEnd::Aborted);
                }
                seen += 1;
                self.publish_progress(kind, ProgressPhase::Reconciling, seen, total, None);

                let state = self.store.get_sync_state_by_remote_id(kind, &remote.id)?;
                let local = match &state {
                    Some(s) => self.store.get_entity(kind, &s.local_id)?,
                    None => self.store.get_entity_by_remote_id(kind, &remote.id)?,
                };
                if let Some(ids) = &options.entity_ids {
                    let matches = local
                        .as_ref()
                        .map(|l| ids.contains(&l.local_id))
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }

                let pair = EntityPair {
                    kind,
                    local,
                    remote: Some(remote.clone()),
                    state,
                };
                match self.reconcile_inbound(ctx, &pair, report).await {
                    Ok(settled) => {
                        if settled {
                            if let Some(id) = pair.local_id() {
                                reconciled.insert(id.to_string());
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("failed to reconcile inbound {kind} {}: {e}", remote.id);
                        report.errors.push(EntityError {
                            kind,
                            entity_id: pair
                                .local_id()
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| remote.id.clone()),
                            message: e.to_string(),
                        });
                    }
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        debug!("pull pass over {kind} reconciled {seen} remote entities");
        Ok(PassEnd::Done)
    }

    /// Reconciles one remote entity against its local pair. Returns whether
    /// the pair is settled from the pull side (the push pass can skip it).
    async fn reconcile_inbound(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        report: &mut SyncReport,
    ) -> SyncResult<bool> {
        let remote = match &pair.remote {
            Some(r) => r,
            None => return Ok(false),
        };

        // A standing conflict blocks automatic applies in both directions.
        if pair
            .state
            .as_ref()
            .is_some_and(|s| s.status == SyncStatus::Conflict)
        {
            report.skipped += 1;
            return Ok(true);
        }

        let remote_hash = change_hash(pair.kind, &remote.data);
        let local_hash = pair.local.as_ref().map(|l| change_hash(pair.kind, &l.data));
        let action = classify(
            local_hash.as_deref(),
            Some(&remote_hash),
            pair.state.as_ref().and_then(|s| s.last_local_hash.as_deref()),
            pair.state.as_ref().and_then(|s| s.last_remote_hash.as_deref()),
        );

        match action {
            SyncAction::NoOp => {
                // Convergent edits or first sighting of already-identical
                // content still need the baselines brought current.
                let stale = pair.state.as_ref().map_or(true, |s| {
                    s.last_remote_hash.as_deref() != Some(remote_hash.as_str())
                        || s.last_local_hash.as_deref() != local_hash.as_deref()
                });
                if stale && pair.local_id().is_some() {
                    self.applier.refresh_baseline(
                        ctx,
                        pair,
                        local_hash.as_deref(),
                        Some(&remote_hash),
                    )?;
                }
                report.skipped += 1;
                Ok(true)
            }
            SyncAction::Pull => {
                // Our own write echoing back through the listing is recorded
                // as a baseline advance, not re-applied.
                if self.guard.should_skip(&remote.data)? && pair.local_id().is_some() {
                    debug!(
                        "suppressed self-echo for {} {}",
                        pair.kind, remote.id
                    );
                    self.applier.refresh_baseline(
                        ctx,
                        pair,
                        local_hash.as_deref(),
                        Some(&remote_hash),
                    )?;
                    report.skipped += 1;
                    return Ok(true);
                }
                let outcome = self.apply_paused(ctx, pair, &remote_hash, SyncAction::Pull).await?;
                self.count(outcome, report);
                Ok(true)
            }
            SyncAction::Push => {
                // Local moved, remote did not; the push pass owns this pair.
                Ok(false)
            }
            SyncAction::Conflict => {
                let local = pair
                    .local
                    .as_ref()
                    .ok_or_else(|| SyncError::Validation("conflict without local".to_string()))?;
                let detail = conflict_detail(
                    pair.kind,
                    &local.local_id,
                    Some(remote.id.as_str()),
                    &local.data,
                    &remote.data,
                );
                self.applier.record_conflict(ctx, pair, &detail)?;
                report.conflicts.push(detail);
                Ok(true)
            }
        }
    }

    async fn push_pass(
        &self,
        ctx: ApplyContext<'_>,
        kind: EntityKind,
        options: &SyncOptions,
        report: &mut SyncReport,
        reconciled: &HashSet<String>,
    ) -> SyncResult<PassEnd> {
        let locals = self.store.list_entities(kind, options.modified_since)?;
        let mut seen = 0u64;
        let total = locals.len() as u64;

        for local in locals {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(PassEnd::Aborted);
            }
            seen += 1;
            self.publish_progress(kind, ProgressPhase::Reconciling, seen, total, None);

            if reconciled.contains(&local.local_id) {
                continue;
            }
            if let Some(ids) = &options.entity_ids {
                if !ids.contains(&local.local_id) {
                    continue;
                }
            }

            let local_id = local.local_id.clone();
            match self.reconcile_outbound(ctx, kind, local, options, report).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("failed to reconcile outbound {kind} {local_id}: {e}");
                    report.errors.push(EntityError {
                        kind,
                        entity_id: local_id,
                        message: e.to_string(),
                    });
                }
            }
        }
        debug!("push pass over {kind} visited {seen} local entities");
        Ok(PassEnd::Done)
    }

    async fn reconcile_outbound(
        &self,
        ctx: ApplyContext<'_>,
        kind: EntityKind,
        local: ledgerlink_types::EntityRecord,
        options: &SyncOptions,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let state = self.store.get_sync_state(kind, &local.local_id)?;
        if state
            .as_ref()
            .is_some_and(|s| s.status == SyncStatus::Conflict)
        {
            report.skipped += 1;
            return Ok(());
        }

        // Fetch the current remote version when a pairing exists; a vanished
        // remote entity falls back to push-as-create.
        let remote_id = state
            .as_ref()
            .and_then(|s| s.remote_id.clone())
            .or_else(|| local.remote_id.clone());
        let remote = match &remote_id {
            Some(rid) => match self.client.get_entity(kind, rid).await {
                Ok(r) => Some(r),
                Err(SyncError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let local_hash = change_hash(kind, &local.data);
        let remote_hash = remote.as_ref().map(|r| change_hash(kind, &r.data));
        let action = classify(
            Some(&local_hash),
            remote_hash.as_deref(),
            state.as_ref().and_then(|s| s.last_local_hash.as_deref()),
            state.as_ref().and_then(|s| s.last_remote_hash.as_deref()),
        );

        let pair = EntityPair {
            kind,
            local: Some(local),
            remote,
            state,
        };

        match action {
            SyncAction::NoOp => {
                let stale = pair.state.as_ref().map_or(true, |s| {
                    s.last_local_hash.as_deref() != Some(local_hash.as_str())
                        || s.last_remote_hash.as_deref() != remote_hash.as_deref()
                });
                if stale {
                    self.applier.refresh_baseline(
                        ctx,
                        &pair,
                        Some(&local_hash),
                        remote_hash.as_deref(),
                    )?;
                }
                report.skipped += 1;
            }
            SyncAction::Push => {
                let outcome = self.apply_paused(ctx, &pair, &local_hash, SyncAction::Push).await?;
                self.count(outcome, report);
            }
            SyncAction::Pull => {
                // Remote moved underneath a push-direction walk. Only apply
                // it when the run pulls; a push-only run leaves it alone.
                if options.direction.pulls() {
                    let hash = remote_hash.unwrap_or_default();
                    let outcome = self.apply_paused(ctx, &pair, &hash, SyncAction::Pull).await?;
                    self.count(outcome, report);
                } else {
                    report.skipped += 1;
                }
            }
            SyncAction::Conflict => {
                let local_ref = pair
                    .local
                    .as_ref()
                    .ok_or_else(|| SyncError::Validation("conflict without local".to_string()))?;
                let remote_ref = pair
                    .remote
                    .as_ref()
                    .ok_or_else(|| SyncError::Validation("conflict without remote".to_string()))?;
                let detail = conflict_detail(
                    kind,
                    &local_ref.local_id,
                    Some(remote_ref.id.as_str()),
                    &local_ref.data,
                    &remote_ref.data,
                );
                self.applier.record_conflict(ctx, &pair, &detail)?;
                report.conflicts.push(detail);
            }
        }
        Ok(())
    }

    /// Applies one push or pull, pausing and retrying on provider rate
    /// limiting instead of failing the entity.
    async fn apply_paused(
        &self,
        ctx: ApplyContext<'_>,
        pair: &EntityPair,
        hash: &str,
        action: SyncAction,
    ) -> SyncResult<ApplyOutcome> {
        let mut pauses = 0u32;
        loop {
            let result = match action {
                SyncAction::Push => self.applier.push(ctx, pair, hash).await,
                SyncAction::Pull => self.applier.pull(ctx, pair, hash).await,
                _ => Ok(ApplyOutcome::Skipped),
            };
            match result {
                Err(SyncError::RateLimited { retry_after })
                    if pauses < self.config.transient_retries =>
                {
                    warn!("rate limited applying {}, pausing {retry_after:?}", pair.kind);
                    tokio::time::sleep(retry_after).await;
                    pauses += 1;
                }
                other => return other,
            }
        }
    }

    fn count(&self, outcome: ApplyOutcome, report: &mut SyncReport) {
        match outcome {
            ApplyOutcome::Created { .. } => report.created += 1,
            ApplyOutcome::Updated { .. } => report.updated += 1,
            ApplyOutcome::Skipped => report.skipped += 1,
        }
    }

    fn fail_kind(&self, kind: EntityKind, error: &SyncError, report: &mut SyncReport) {
        warn!("sync pass over {kind} failed: {error}");
        report.errors.push(EntityError {
            kind,
            entity_id: String::new(),
            message: error.to_string(),
        });
        self.publish_progress(kind, ProgressPhase::Failed, 0, 0, Some(error.to_string()));
    }

    fn publish_progress(
        &self,
        kind: EntityKind,
        phase: ProgressPhase,
        current: u64,
        total: u64,
        error: Option<String>,
    ) {
        self.progress.publish(ProgressEvent::KindProgress {
            kind,
            state: ProgressState {
                phase,
                current,
                total,
                last_synced_at: Some(Utc::now()),
                error,
            },
        });
    }

    fn finish(&self, correlation_id: &str, report: &SyncReport) {
        info!(
            correlation_id = %correlation_id,
            outcome = ?report.outcome,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            "sync run finished"
        );
        self.progress.publish(ProgressEvent::RunFinished {
            correlation_id: correlation_id.to_string(),
            outcome: report.outcome,
        });
    }
}
