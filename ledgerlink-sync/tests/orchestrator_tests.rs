use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ledgerlink_store::LocalStore;
use ledgerlink_sync::{
    change_hash, EntityPage, LedgerClient, SyncConfig, SyncError, SyncOrchestrator, SyncResult,
    TokenRefreshService,
};
use ledgerlink_types::{
    ConflictResolution, EntityKind, EntityRecord, RemoteEntity, RunOutcome, SyncDirection,
    SyncOperation, SyncOptions, SyncState, SyncStatus, TokenSet,
};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory ledger double. Entities keyed by remote id; counters record
/// write traffic so tests can assert what the engine sent.
#[derive(Default)]
struct FakeLedger {
    entities: Mutex<HashMap<(EntityKind, String), RemoteEntity>>,
    next_id: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    list_delay_ms: u64,
    reject_names: Mutex<Vec<String>>,
}

impl FakeLedger {
    fn with_list_delay(ms: u64) -> Self {
        Self {
            list_delay_ms: ms,
            ..Self::default()
        }
    }

    /// Makes `create_entity` answer 422 for payloads carrying this name.
    fn reject_name(&self, name: &str) {
        self.reject_names.lock().unwrap().push(name.to_string());
    }

    fn insert(&self, kind: EntityKind, id: &str, data: serde_json::Value) {
        self.entities.lock().unwrap().insert(
            (kind, id.to_string()),
            RemoteEntity {
                id: id.to_string(),
                data,
                updated_at: Some(Utc::now()),
            },
        );
    }

    fn data_of(&self, kind: EntityKind, id: &str) -> serde_json::Value {
        self.entities
            .lock()
            .unwrap()
            .get(&(kind, id.to_string()))
            .map(|e| e.data.clone())
            .expect("entity not on fake ledger")
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn list_entities(
        &self,
        kind: EntityKind,
        _cursor: Option<&str>,
        _modified_since: Option<chrono::DateTime<Utc>>,
    ) -> SyncResult<EntityPage> {
        if self.list_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.list_delay_ms)).await;
        }
        let items = self
            .entities
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, e)| e.clone())
            .collect();
        Ok(EntityPage {
            items,
            next_cursor: None,
        })
    }

    async fn get_entity(&self, kind: EntityKind, remote_id: &str) -> SyncResult<RemoteEntity> {
        self.entities
            .lock()
            .unwrap()
            .get(&(kind, remote_id.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("{kind} {remote_id}")))
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        payload: &serde_json::Value,
    ) -> SyncResult<String> {
        if let Some(name) = payload.get("name").and_then(|v| v.as_str()) {
            if self.reject_names.lock().unwrap().iter().any(|n| n == name) {
                return Err(SyncError::Validation(format!(
                    "name {name:?} rejected by ledger"
                )));
            }
        }
        let id = format!("r-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.insert(kind, &id, payload.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        remote_id: &str,
        payload: &serde_json::Value,
    ) -> SyncResult<()> {
        let mut entities = self.entities.lock().unwrap();
        let entry = entities
            .get_mut(&(kind, remote_id.to_string()))
            .ok_or_else(|| SyncError::NotFound(format!("{kind} {remote_id}")))?;
        entry.data = payload.clone();
        entry.updated_at = Some(Utc::now());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_token(&self, _refresh_token: &str) -> SyncResult<TokenSet> {
        Ok(TokenSet {
            access_token: "at-fresh".into(),
            refresh_token: "rt-fresh".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }
}

async fn engine(fake: Arc<FakeLedger>) -> (SyncOrchestrator, LocalStore) {
    let store = LocalStore::open_in_memory().unwrap();
    let bearer = Arc::new(tokio::sync::RwLock::new(Some("at".to_string())));
    let tokens = Arc::new(TokenRefreshService::new(fake.clone(), bearer, 600));
    tokens
        .install(TokenSet {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now() + ChronoDuration::hours(2),
        })
        .await;
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        fake,
        tokens,
        SyncConfig::for_base_url("http://fake.invalid"),
    );
    (orchestrator, store)
}

fn seed_local(store: &LocalStore, kind: EntityKind, local_id: &str, data: serde_json::Value) {
    store
        .upsert_entity(&EntityRecord {
            kind,
            local_id: local_id.to_string(),
            remote_id: None,
            data,
            updated_at: Utc::now(),
        })
        .unwrap();
}

/// Seeds a reconciled pair: local entity, remote entity, and a baseline
/// sync-state row with both fingerprints current.
fn seed_pair(
    store: &LocalStore,
    fake: &FakeLedger,
    kind: EntityKind,
    local_id: &str,
    remote_id: &str,
    local_data: serde_json::Value,
    remote_data: serde_json::Value,
) {
    store
        .upsert_entity(&EntityRecord {
            kind,
            local_id: local_id.to_string(),
            remote_id: Some(remote_id.to_string()),
            data: local_data.clone(),
            updated_at: Utc::now(),
        })
        .unwrap();
    fake.insert(kind, remote_id, remote_data.clone());
    let now = Utc::now();
    store
        .upsert_sync_state(&SyncState {
            kind,
            local_id: local_id.to_string(),
            remote_id: Some(remote_id.to_string()),
            status: SyncStatus::Active,
            last_local_hash: Some(change_hash(kind, &local_data)),
            last_remote_hash: Some(change_hash(kind, &remote_data)),
            correlation_id: "seed".to_string(),
            conflict_data: None,
            created_at: now,
            updated_at: now,
        })
        .unwrap();
}

#[tokio::test]
async fn pull_creates_local_entity() {
    let fake = Arc::new(FakeLedger::default());
    fake.insert(
        EntityKind::Invoice,
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "draft", "tax_total": "9.00" }),
    );
    let (orchestrator, store) = engine(fake.clone()).await;

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Pull), None)
        .await
        .unwrap();
    assert_eq!(report.created, 1);
    assert!(report.success);

    let local = store
        .get_entity_by_remote_id(EntityKind::Invoice, "r-1")
        .unwrap()
        .expect("pulled entity missing");
    assert_eq!(local.data["reference"], "INV-1");
    assert_eq!(local.data["tax_total"], "9.00");

    let state = store
        .get_sync_state(EntityKind::Invoice, &local.local_id)
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Active);
    assert!(state.last_local_hash.is_some());
    assert!(state.last_remote_hash.is_some());
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let fake = Arc::new(FakeLedger::default());
    fake.insert(
        EntityKind::Contact,
        "r-1",
        serde_json::json!({ "name": "Alice", "email": "alice@example.com" }),
    );
    let (orchestrator, store) = engine(fake.clone()).await;

    let first = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(first.created, 1);

    let before = store
        .get_entity_by_remote_id(EntityKind::Contact, "r-1")
        .unwrap()
        .unwrap();
    let second = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert!(second.success);

    let after = store
        .get_entity_by_remote_id(EntityKind::Contact, "r-1")
        .unwrap()
        .unwrap();
    assert_eq!(before.data, after.data);
    assert_eq!(fake.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn push_creates_remote_and_masks_owned_fields() {
    let fake = Arc::new(FakeLedger::default());
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_local(
        &store,
        EntityKind::Contact,
        "c-1",
        serde_json::json!({
            "name": "Bob",
            "notes": "met at conference",
            "outstanding_balance": "50.00"
        }),
    );

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Push), None)
        .await
        .unwrap();
    assert_eq!(report.created, 1);

    let state = store
        .get_sync_state(EntityKind::Contact, "c-1")
        .unwrap()
        .unwrap();
    let remote_id = state.remote_id.expect("remote id recorded");
    let pushed = fake.data_of(EntityKind::Contact, &remote_id);
    assert_eq!(pushed["name"], "Bob");
    assert_eq!(pushed["notes"], "met at conference");
    // Remote-computed fields never travel outward.
    assert!(pushed.get("outstanding_balance").is_none());
    assert!(pushed["sync_marker"]
        .as_str()
        .unwrap()
        .starts_with("lsync:"));
}

#[tokio::test]
async fn remote_only_change_pulls_and_preserves_local_fields() {
    let fake = Arc::new(FakeLedger::default());
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_pair(
        &store,
        &fake,
        EntityKind::Invoice,
        "i-1",
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "draft", "notes": "internal" }),
        serde_json::json!({ "reference": "INV-1", "status": "draft", "tax_total": "9.00" }),
    );

    // Remote advances the invoice; local is untouched.
    fake.insert(
        EntityKind::Invoice,
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "sent", "tax_total": "9.00" }),
    );

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.conflicts.len(), 0);
    assert_eq!(fake.updates.load(Ordering::SeqCst), 0);

    let local = store.get_entity(EntityKind::Invoice, "i-1").unwrap().unwrap();
    assert_eq!(local.data["status"], "sent");
    assert_eq!(local.data["notes"], "internal");
    assert_eq!(local.data["tax_total"], "9.00");

    // The baselines are current again: another run applies nothing.
    let again = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(again.created + again.updated, 0);
}

#[tokio::test]
async fn concurrent_edits_conflict_without_writes() {
    let fake = Arc::new(FakeLedger::default());
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_pair(
        &store,
        &fake,
        EntityKind::Invoice,
        "i-1",
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "draft" }),
        serde_json::json!({ "reference": "INV-1", "status": "draft" }),
    );

    // Both sides move, differently.
    seed_local(
        &store,
        EntityKind::Invoice,
        "i-1",
        serde_json::json!({ "reference": "INV-1", "status": "paid" }),
    );
    fake.insert(
        EntityKind::Invoice,
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "sent" }),
    );

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(report.conflicts.len(), 1);
    let detail = &report.conflicts[0];
    assert_eq!(detail.fields.len(), 1);
    assert_eq!(detail.fields[0].field, "status");

    // Neither side was written.
    assert_eq!(fake.updates.load(Ordering::SeqCst), 0);
    let local = store.get_entity(EntityKind::Invoice, "i-1").unwrap().unwrap();
    assert_eq!(local.data["status"], "paid");
    assert_eq!(fake.data_of(EntityKind::Invoice, "r-1")["status"], "sent");

    let state = store.get_sync_state(EntityKind::Invoice, "i-1").unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Conflict);

    // A standing conflict blocks further automatic applies.
    let again = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(again.conflicts.len(), 0);
    assert_eq!(again.created + again.updated, 0);
    assert_eq!(fake.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resolve_use_local_repushes_local_version() {
    let fake = Arc::new(FakeLedger::default());
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_pair(
        &store,
        &fake,
        EntityKind::Invoice,
        "i-1",
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "draft" }),
        serde_json::json!({ "reference": "INV-1", "status": "draft" }),
    );
    seed_local(
        &store,
        EntityKind::Invoice,
        "i-1",
        serde_json::json!({ "reference": "INV-1", "status": "paid" }),
    );
    fake.insert(
        EntityKind::Invoice,
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "sent" }),
    );
    orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();

    let state = orchestrator
        .resolve_conflict(
            EntityKind::Invoice,
            "i-1",
            ConflictResolution::UseLocal,
            Some("customer confirmed payment".into()),
            Some("user-7".into()),
        )
        .await
        .unwrap();
    assert_eq!(state.status, SyncStatus::Active);
    assert!(state.conflict_data.is_none());

    assert_eq!(fake.data_of(EntityKind::Invoice, "r-1")["status"], "paid");
    let log = store.list_log_for_entity(EntityKind::Invoice, "i-1").unwrap();
    assert!(log
        .iter()
        .any(|e| e.operation == SyncOperation::ConflictResolved
            && e.user_id.as_deref() == Some("user-7")));
}

#[tokio::test]
async fn resolve_use_remote_pulls_remote_version() {
    let fake = Arc::new(FakeLedger::default());
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_pair(
        &store,
        &fake,
        EntityKind::Contact,
        "c-1",
        "r-1",
        serde_json::json!({ "name": "Alice", "notes": "vip" }),
        serde_json::json!({ "name": "Alice" }),
    );
    seed_local(
        &store,
        EntityKind::Contact,
        "c-1",
        serde_json::json!({ "name": "Alice Smith", "notes": "vip" }),
    );
    fake.insert(
        EntityKind::Contact,
        "r-1",
        serde_json::json!({ "name": "Alice Jones" }),
    );
    orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();

    let state = orchestrator
        .resolve_conflict(
            EntityKind::Contact,
            "c-1",
            ConflictResolution::UseRemote,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(state.status, SyncStatus::Active);

    let local = store.get_entity(EntityKind::Contact, "c-1").unwrap().unwrap();
    assert_eq!(local.data["name"], "Alice Jones");
    // Local-owned annotation survives the remote taking the shared fields.
    assert_eq!(local.data["notes"], "vip");
    assert_eq!(fake.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn own_echo_is_suppressed() {
    let fake = Arc::new(FakeLedger::default());
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_local(
        &store,
        EntityKind::Payment,
        "p-1",
        serde_json::json!({ "amount": "120.00", "date": "2025-06-01" }),
    );

    orchestrator
        .sync(SyncOptions::new(SyncDirection::Push), None)
        .await
        .unwrap();
    let state = store.get_sync_state(EntityKind::Payment, "p-1").unwrap().unwrap();
    let remote_id = state.remote_id.clone().unwrap();

    // The ledger normalizes the date on ingest and the change comes back in
    // the next listing, still carrying our marker.
    let mut echoed = fake.data_of(EntityKind::Payment, &remote_id);
    echoed["date"] = serde_json::json!("2025-06-01T00:00:00Z");
    fake.insert(EntityKind::Payment, &remote_id, echoed);

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Pull), None)
        .await
        .unwrap();
    assert_eq!(report.created + report.updated, 0);
    assert!(report.skipped >= 1);

    // The local record was not rewritten by our own reflected push.
    let local = store.get_entity(EntityKind::Payment, "p-1").unwrap().unwrap();
    assert_eq!(local.data["date"], "2025-06-01");
    let log = store.list_log_for_entity(EntityKind::Payment, "p-1").unwrap();
    assert!(log.iter().any(|e| e.operation == SyncOperation::Skip));
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let fake = Arc::new(FakeLedger::default());
    fake.insert(
        EntityKind::Invoice,
        "r-1",
        serde_json::json!({ "reference": "INV-1", "status": "draft" }),
    );
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_local(
        &store,
        EntityKind::Contact,
        "c-1",
        serde_json::json!({ "name": "Bob" }),
    );

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both).dry_run(), None)
        .await
        .unwrap();
    assert_eq!(report.created, 2);

    assert!(store
        .get_entity_by_remote_id(EntityKind::Invoice, "r-1")
        .unwrap()
        .is_none());
    assert!(store.get_sync_state(EntityKind::Contact, "c-1").unwrap().is_none());
    assert_eq!(store.log_count().unwrap(), 0);
    assert_eq!(fake.creates.load(Ordering::SeqCst), 0);

    // The live run then produces exactly what the dry run reported.
    let live = orchestrator
        .sync(SyncOptions::new(SyncDirection::Both), None)
        .await
        .unwrap();
    assert_eq!(live.created, report.created);
}

#[tokio::test]
async fn overlapping_runs_are_rejected() {
    let fake = Arc::new(FakeLedger::with_list_delay(200));
    fake.insert(
        EntityKind::Contact,
        "r-1",
        serde_json::json!({ "name": "Alice" }),
    );
    let (orchestrator, _store) = engine(fake).await;
    let orchestrator = Arc::new(orchestrator);

    let first = {
        let orch = orchestrator.clone();
        tokio::spawn(async move { orch.sync(SyncOptions::new(SyncDirection::Pull), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = orchestrator
        .sync(SyncOptions::new(SyncDirection::Pull), None)
        .await;
    assert!(matches!(second.unwrap_err(), SyncError::RunInProgress(_)));

    let report = first.await.unwrap().unwrap();
    assert!(report.success);
}

#[tokio::test]
async fn rejected_entity_partially_fails_run() {
    let fake = Arc::new(FakeLedger::default());
    fake.reject_name("Mallory");
    let (orchestrator, store) = engine(fake.clone()).await;
    seed_local(
        &store,
        EntityKind::Contact,
        "c-1",
        serde_json::json!({ "name": "Mallory" }),
    );
    seed_local(
        &store,
        EntityKind::Contact,
        "c-2",
        serde_json::json!({ "name": "Carol" }),
    );

    let report = orchestrator
        .sync(SyncOptions::new(SyncDirection::Push), None)
        .await
        .unwrap();

    // The rejection lands in errors[] and the run keeps going.
    assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
    assert!(!report.success);
    assert_eq!(report.created, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].entity_id, "c-1");
    assert!(report.errors[0].message.contains("Mallory"));

    // The accepted entity is fully linked; the rejected one stays unpaired.
    let linked = store.get_sync_state(EntityKind::Contact, "c-2").unwrap().unwrap();
    assert!(linked.remote_id.is_some());
    let failed = store.get_sync_state(EntityKind::Contact, "c-1").unwrap();
    assert!(failed.is_none());
    assert_eq!(fake.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abort_stops_run_between_entities() {
    let fake = Arc::new(FakeLedger::with_list_delay(200));
    fake.insert(
        EntityKind::Contact,
        "r-1",
        serde_json::json!({ "name": "Alice" }),
    );
    let (orchestrator, store) = engine(fake).await;
    let orchestrator = Arc::new(orchestrator);

    let run = {
        let orch = orchestrator.clone();
        tokio::spawn(async move { orch.sync(SyncOptions::new(SyncDirection::Pull), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.request_abort();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(!report.success);
    assert_eq!(report.created, 0);

    // Nothing was half-applied before the stop.
    assert!(store
        .get_entity_by_remote_id(EntityKind::Contact, "r-1")
        .unwrap()
        .is_none());
    assert_eq!(store.log_count().unwrap(), 0);
}

#[tokio::test]
async fn bidirectional_run_excludes_single_direction_run() {
    let fake = Arc::new(FakeLedger::with_list_delay(200));
    fake.insert(
        EntityKind::Contact,
        "r-1",
        serde_json::json!({ "name": "Alice" }),
    );
    let (orchestrator, _store) = engine(fake).await;
    let orchestrator = Arc::new(orchestrator);

    let first = {
        let orch = orchestrator.clone();
        tokio::spawn(async move { orch.sync(SyncOptions::new(SyncDirection::Both), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A bidirectional run holds the pull and push scopes for every kind.
    let pull = orchestrator
        .sync(SyncOptions::new(SyncDirection::Pull), None)
        .await;
    assert!(matches!(pull.unwrap_err(), SyncError::RunInProgress(_)));
    let push = orchestrator
        .sync(SyncOptions::new(SyncDirection::Push), None)
        .await;
    assert!(matches!(push.unwrap_err(), SyncError::RunInProgress(_)));

    let report = first.await.unwrap().unwrap();
    assert!(report.success);
}

#[tokio::test]
async fn entity_kind_filter_limits_run() {
    let fake = Arc::new(FakeLedger::default());
    fake.insert(
        EntityKind::Contact,
        "r-1",
        serde_json::json!({ "name": "Alice" }),
    );
    fake.insert(
        EntityKind::Invoice,
        "r-2",
        serde_json::json!({ "reference": "INV-2", "status": "draft" }),
    );
    let (orchestrator, store) = engine(fake).await;

    let mut options = SyncOptions::new(SyncDirection::Pull);
    options.kinds = Some(vec![EntityKind::Contact]);
    let report = orchestrator.sync(options, None).await.unwrap();
    assert_eq!(report.created, 1);
    assert!(store
        .get_entity_by_remote_id(EntityKind::Invoice, "r-2")
        .unwrap()
        .is_none());
}
