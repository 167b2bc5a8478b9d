//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL for the remote ledger API (e.g., "https://ledger.example.com").
    pub api_base_url: String,

    /// Integration identifier used to scope run locks and token refresh.
    pub integration_id: String,

    /// Remote page size for list calls.
    pub page_size: usize,

    /// Refresh the access token when it expires within this margin (seconds).
    pub token_refresh_margin_secs: i64,

    /// Retry attempts for transient network failures per call.
    pub transient_retries: u32,

    /// Base delay for exponential backoff between transient retries (ms).
    pub retry_backoff_ms: u64,

    /// How far back echo suppression looks for self-originated writes.
    pub loop_guard_window_secs: i64,

    /// HTTP request timeout.
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://ledger.example.com".to_string(),
            integration_id: "default".to_string(),
            page_size: 100,
            token_refresh_margin_secs: 600, // 10 minutes before expiry
            transient_retries: 3,
            retry_backoff_ms: 500,
            loop_guard_window_secs: 24 * 3600,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms * (1 << attempt))
    }

    /// Creates a config pointed at a mock server (for testing).
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: base_url.into(),
            page_size: 10,
            retry_backoff_ms: 10,
            ..Self::default()
        }
    }
}
