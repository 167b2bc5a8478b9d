//! OAuth token lifecycle with single-flight refresh.
//!
//! The ledger provider rotates the refresh token on every use, so two
//! concurrent refreshes would race: the first wins, the second presents an
//! already-dead refresh token and strands the caller. All refreshes are
//! serialized behind a mutex, and a generation counter lets callers that
//! waited on the lock reuse the refresh that completed in the meantime.

use crate::client::{BearerSlot, LedgerClient};
use crate::error::{SyncError, SyncResult};
use ledgerlink_types::TokenSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

struct TokenState {
    tokens: Option<TokenSet>,
    /// Bumped on every successful refresh; used to detect that a concurrent
    /// refresh already replaced the tokens while we waited on the lock.
    generation: u64,
}

/// Keeps the remote credential valid for one integration.
pub struct TokenRefreshService {
    client: Arc<dyn LedgerClient>,
    bearer: BearerSlot,
    state: RwLock<TokenState>,
    refresh_lock: Mutex<()>,
    margin_secs: i64,
}

impl TokenRefreshService {
    pub fn new(client: Arc<dyn LedgerClient>, bearer: BearerSlot, margin_secs: i64) -> Self {
        Self {
            client,
            bearer,
            state: RwLock::new(TokenState {
                tokens: None,
                generation: 0,
            }),
            refresh_lock: Mutex::new(()),
            margin_secs,
        }
    }

    /// Installs a token set (initial connect or restored session).
    pub async fn install(&self, tokens: TokenSet) {
        *self.bearer.write().await = Some(tokens.access_token.clone());
        let mut state = self.state.write().await;
        state.tokens = Some(tokens);
    }

    /// Clears all credential state (disconnect).
    pub async fn clear(&self) {
        *self.bearer.write().await = None;
        let mut state = self.state.write().await;
        state.tokens = None;
    }

    pub async fn current(&self) -> Option<TokenSet> {
        self.state.read().await.tokens.clone()
    }

    /// Returns a valid token set, refreshing proactively when expiry is
    /// within the configured margin. At most one refresh is in flight;
    /// concurrent callers await it and share its result.
    pub async fn ensure_valid(&self) -> SyncResult<TokenSet> {
        // Fast path: current tokens are comfortably valid.
        let pre_gen = {
            let state = self.state.read().await;
            if let Some(ref t) = state.tokens {
                if !t.expires_within_secs(self.margin_secs) {
                    return Ok(t.clone());
                }
                debug!("access token expires within {}s, refreshing", self.margin_secs);
            }
            state.generation
        };

        self.refresh_inner(pre_gen).await
    }

    /// Forces a refresh regardless of expiry (still single-flight).
    pub async fn force_refresh(&self) -> SyncResult<TokenSet> {
        let pre_gen = self.state.read().await.generation;
        self.refresh_inner(pre_gen).await
    }

    async fn refresh_inner(&self, pre_gen: u64) -> SyncResult<TokenSet> {
        // Only one token exchange may be in flight at a time.
        let _guard = self.refresh_lock.lock().await;

        // Double-check: if the generation advanced while we waited, a
        // concurrent refresh already succeeded. Use its tokens.
        {
            let state = self.state.read().await;
            if state.generation > pre_gen {
                if let Some(ref t) = state.tokens {
                    return Ok(t.clone());
                }
            }
        }

        let refresh_token = {
            let state = self.state.read().await;
            state
                .tokens
                .as_ref()
                .map(|t| t.refresh_token.clone())
                .ok_or_else(|| SyncError::Auth("no credentials installed".to_string()))?
        };

        let new_tokens = self.client.refresh_token(&refresh_token).await.map_err(|e| {
            warn!("token refresh failed: {e}");
            // A dead refresh token means the session is gone
            if e.is_fatal() {
                self.clear_blocking();
            }
            e
        })?;

        *self.bearer.write().await = Some(new_tokens.access_token.clone());
        let mut state = self.state.write().await;
        state.tokens = Some(new_tokens.clone());
        state.generation += 1;
        debug!("refreshed ledger tokens, expires at {}", new_tokens.expires_at);

        Ok(new_tokens)
    }

    fn clear_blocking(&self) {
        // Best-effort clear from a sync context inside the error path; the
        // slot is cleared on the next ensure_valid failure regardless.
        if let Ok(mut bearer) = self.bearer.try_write() {
            *bearer = None;
        }
        if let Ok(mut state) = self.state.try_write() {
            state.tokens = None;
        }
    }
}
