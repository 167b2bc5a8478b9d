//! Shared types for LedgerLink sync operations.
//!
//! Domain records (contacts, invoices, payments are stored as typed JSON),
//! the persistent sync bookkeeping rows (`SyncState`, `SyncLogEntry`), and
//! the transient report/progress types exchanged between the engine and its
//! callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of entity kinds this engine synchronizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Invoice,
    Payment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Contact,
        EntityKind::Invoice,
        EntityKind::Payment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact",
            EntityKind::Invoice => "invoice",
            EntityKind::Payment => "payment",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "contact" => Some(EntityKind::Contact),
            "invoice" => Some(EntityKind::Invoice),
            "payment" => Some(EntityKind::Payment),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business entity as stored locally: typed JSON plus identity and
/// modification metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub local_id: String,
    pub remote_id: Option<String>,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// A business entity as returned by the remote ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: String,
    pub data: serde_json::Value,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Direction of a sync run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
    Both,
}

impl SyncDirection {
    pub fn pulls(&self) -> bool {
        matches!(self, SyncDirection::Pull | SyncDirection::Both)
    }

    pub fn pushes(&self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::Both)
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Both => "both",
        };
        f.write_str(s)
    }
}

/// Per-entity sync lifecycle status.
///
/// `Conflict` blocks automatic apply for that entity until explicitly
/// resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Active,
    Conflict,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Active => "active",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<SyncStatus> {
        match s {
            "active" => Some(SyncStatus::Active),
            "conflict" => Some(SyncStatus::Conflict),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// One row per (kind, local entity): the last reconciled fingerprints of
/// both sides plus conflict bookkeeping. Created on first successful
/// reconciliation, mutated on every subsequent one, never deleted on its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncState {
    pub kind: EntityKind,
    pub local_id: String,
    pub remote_id: Option<String>,
    pub status: SyncStatus,
    pub last_local_hash: Option<String>,
    pub last_remote_hash: Option<String>,
    /// Correlation id of the most recent run that touched this entity.
    pub correlation_id: String,
    /// Opaque `ConflictDetail` JSON while `status == Conflict`.
    pub conflict_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operation recorded in the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Skip,
    ConflictDetected,
    ConflictResolved,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Skip => "skip",
            SyncOperation::ConflictDetected => "conflict_detected",
            SyncOperation::ConflictResolved => "conflict_resolved",
        }
    }

    pub fn parse(s: &str) -> Option<SyncOperation> {
        match s {
            "create" => Some(SyncOperation::Create),
            "update" => Some(SyncOperation::Update),
            "skip" => Some(SyncOperation::Skip),
            "conflict_detected" => Some(SyncOperation::ConflictDetected),
            "conflict_resolved" => Some(SyncOperation::ConflictResolved),
            _ => None,
        }
    }
}

/// Which side originated the write being logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOrigin {
    Local,
    Remote,
}

impl SyncOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOrigin::Local => "local",
            SyncOrigin::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<SyncOrigin> {
        match s {
            "local" => Some(SyncOrigin::Local),
            "remote" => Some(SyncOrigin::Remote),
            _ => None,
        }
    }
}

/// Outcome of a logged operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<LogStatus> {
        match s {
            "success" => Some(LogStatus::Success),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only audit record of every sync operation. Immutable once written;
/// the sole audit trail and the input to echo-loop suppression.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Row id; 0 until persisted.
    #[serde(default)]
    pub id: i64,
    pub correlation_id: String,
    pub kind: EntityKind,
    pub entity_id: String,
    pub remote_id: Option<String>,
    pub operation: SyncOperation,
    pub origin: SyncOrigin,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub change_hash: Option<String>,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One differing field in a detected conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local: Option<serde_json::Value>,
    pub remote: Option<serde_json::Value>,
}

/// Field-level before/after pairs from both sides of a conflicted entity,
/// used to render resolution choices. Derived, not persisted on its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub kind: EntityKind,
    pub local_id: String,
    pub remote_id: Option<String>,
    pub fields: Vec<FieldDiff>,
    pub local_snapshot: serde_json::Value,
    pub remote_snapshot: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// How a human resolved a conflicted entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    UseLocal,
    UseRemote,
    Manual,
}

/// Phase of one entity kind within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Pending,
    Listing,
    Reconciling,
    Completed,
    Failed,
}

/// Transient per-kind progress. Rebuilt each run, never persisted.
#[derive(Clone, Debug, Deserialize)]
pub struct ProgressState {
    pub phase: ProgressPhase,
    pub current: u64,
    pub total: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ProgressState {
    pub fn idle() -> Self {
        Self {
            phase: ProgressPhase::Pending,
            current: 0,
            total: 0,
            last_synced_at: None,
            error: None,
        }
    }

    /// Completion percentage, 0.0 when the total is not yet known.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64) * 100.0
        }
    }
}

// Hand-written so the computed percentage travels with the counters in
// streamed progress payloads.
impl Serialize for ProgressState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ProgressState", 6)?;
        s.serialize_field("phase", &self.phase)?;
        s.serialize_field("current", &self.current)?;
        s.serialize_field("total", &self.total)?;
        s.serialize_field("percentage", &self.percentage())?;
        s.serialize_field("last_synced_at", &self.last_synced_at)?;
        s.serialize_field("error", &self.error)?;
        s.end()
    }
}

/// Events published on the progress bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        correlation_id: String,
        direction: SyncDirection,
        dry_run: bool,
    },
    KindProgress {
        kind: EntityKind,
        state: ProgressState,
    },
    RunFinished {
        correlation_id: String,
        outcome: RunOutcome,
    },
}

/// Terminal state of a sync run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    PartiallyFailed,
    Aborted,
}

/// One per-entity failure accumulated during a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityError {
    pub kind: EntityKind,
    pub entity_id: String,
    pub message: String,
}

/// Result of a whole sync run. `errors` need investigation, `conflicts`
/// need a human decision, the counts are what worked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: bool,
    pub outcome: RunOutcome,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub conflicts: Vec<ConflictDetail>,
    pub errors: Vec<EntityError>,
    pub correlation_id: String,
}

impl SyncReport {
    pub fn empty(correlation_id: String) -> Self {
        Self {
            success: true,
            outcome: RunOutcome::Completed,
            created: 0,
            updated: 0,
            skipped: 0,
            conflicts: Vec::new(),
            errors: Vec::new(),
            correlation_id,
        }
    }
}

/// Caller-supplied parameters for one sync run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncOptions {
    pub direction: SyncDirection,
    #[serde(default)]
    pub dry_run: bool,
    /// Restrict the run to these kinds; `None` means all kinds.
    #[serde(default)]
    pub kinds: Option<Vec<EntityKind>>,
    /// Restrict the run to these local entity ids.
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub modified_since: Option<DateTime<Utc>>,
    /// Force a token refresh before the run starts.
    #[serde(default)]
    pub force_refresh: bool,
}

impl SyncOptions {
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            dry_run: false,
            kinds: None,
            entity_ids: None,
            modified_since: None,
            force_refresh: false,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// OAuth2 token pair with expiry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Returns true if the access token expires within the given seconds.
    pub fn expires_within_secs(&self, secs: i64) -> bool {
        Utc::now() + chrono::Duration::seconds(secs) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entity_kind_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("journal"), None);
    }

    #[test]
    fn direction_predicates() {
        assert!(SyncDirection::Pull.pulls());
        assert!(!SyncDirection::Pull.pushes());
        assert!(SyncDirection::Both.pulls());
        assert!(SyncDirection::Both.pushes());
    }

    #[test]
    fn progress_percentage() {
        let mut state = ProgressState::idle();
        assert_eq!(state.percentage(), 0.0);
        state.total = 200;
        state.current = 50;
        assert_eq!(state.percentage(), 25.0);
    }

    #[test]
    fn progress_state_serializes_percentage() {
        let mut state = ProgressState::idle();
        state.phase = ProgressPhase::Reconciling;
        state.total = 4;
        state.current = 1;
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["percentage"], 25.0);
        assert_eq!(value["current"], 1);
        // The extra field does not break reading the payload back.
        let parsed: ProgressState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.current, 1);
        assert_eq!(parsed.total, 4);
    }

    #[test]
    fn token_expiry_margin() {
        let token = TokenSet {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(300),
        };
        assert!(!token.is_expired());
        assert!(token.expires_within_secs(600));
        assert!(!token.expires_within_secs(60));
    }

    #[test]
    fn sync_options_deserializes_sparse_body() {
        let opts: SyncOptions =
            serde_json::from_str(r#"{ "direction": "pull" }"#).unwrap();
        assert_eq!(opts.direction, SyncDirection::Pull);
        assert!(!opts.dry_run);
        assert!(opts.kinds.is_none());
    }
}
