//! Two-way synchronization engine between the local store and a remote
//! ledger service.
//!
//! The engine reconciles contacts, invoices and payments by comparing
//! content fingerprints against the last-reconciled baselines, applying
//! one-sided changes in the right direction, and surfacing both-sided
//! changes as conflicts for a human to resolve. Outbound writes carry a
//! correlation marker so their own webhook/list echoes are recognized and
//! suppressed instead of bouncing back and forth.

pub mod applier;
pub mod client;
pub mod config;
pub mod error;
pub mod guard;
pub mod hash;
pub mod orchestrator;
pub mod ownership;
pub mod progress;
pub mod token;

/// Payload field carrying the loop-suppression marker on pushed entities.
/// Excluded from content fingerprints on both sides.
pub const SYNC_MARKER_FIELD: &str = "sync_marker";

pub use applier::{ApplyContext, ApplyOutcome, ChangeApplier, EntityPair};
pub use client::{BearerSlot, EntityPage, HttpLedgerClient, LedgerClient};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use guard::LoopGuard;
pub use hash::{change_hash, classify, conflict_detail, SyncAction};
pub use orchestrator::SyncOrchestrator;
pub use ownership::{FieldOwnership, FieldOwnershipResolver};
pub use progress::ProgressBus;
pub use token::TokenRefreshService;
