//! HTTP client for the remote ledger service.
//!
//! The capability set (paginated list, get, create, update, token refresh)
//! is an explicit trait so the engine and its tests can run against a fake
//! with no network dependency. The reqwest implementation maps response
//! statuses into the engine's error taxonomy and retries transient failures
//! with bounded exponential backoff.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerlink_types::{EntityKind, RemoteEntity, TokenSet};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One page of remote entities.
#[derive(Clone, Debug, Deserialize)]
pub struct EntityPage {
    pub items: Vec<RemoteEntity>,
    pub next_cursor: Option<String>,
}

/// Capability set of the remote ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Lists entities of a kind, one page at a time.
    async fn list_entities(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<EntityPage>;

    async fn get_entity(&self, kind: EntityKind, remote_id: &str) -> SyncResult<RemoteEntity>;

    /// Creates an entity, returning the remote id.
    async fn create_entity(
        &self,
        kind: EntityKind,
        payload: &serde_json::Value,
    ) -> SyncResult<String>;

    async fn update_entity(
        &self,
        kind: EntityKind,
        remote_id: &str,
        payload: &serde_json::Value,
    ) -> SyncResult<()>;

    /// Exchanges a refresh token for a new token set. Stateless: callers own
    /// the token lifecycle.
    async fn refresh_token(&self, refresh_token: &str) -> SyncResult<TokenSet>;
}

/// Slot holding the current bearer token, shared between the HTTP client and
/// the token refresh service.
pub type BearerSlot = Arc<RwLock<Option<String>>>;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

/// reqwest-backed ledger client.
pub struct HttpLedgerClient {
    client: Client,
    config: SyncConfig,
    bearer: BearerSlot,
}

impl HttpLedgerClient {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            bearer: Arc::new(RwLock::new(None)),
        })
    }

    /// Handle to the bearer slot, for wiring up the token refresh service.
    pub fn bearer_slot(&self) -> BearerSlot {
        self.bearer.clone()
    }

    async fn bearer(&self) -> SyncResult<String> {
        self.bearer
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::Auth("no access token installed".to_string()))
    }

    /// Sends a request, retrying transient failures with exponential backoff.
    /// The builder closure is re-invoked per attempt because a reqwest
    /// request body is consumed on send.
    async fn send_with_retry<F>(&self, build: F) -> SyncResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let result = match build().send().await {
                Ok(resp) => classify_status(resp).await,
                Err(e) => Err(SyncError::from(e)),
            };
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < self.config.transient_retries => {
                    let backoff = self.config.retry_backoff(attempt);
                    warn!("transient ledger error, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn entity_url(&self, kind: EntityKind) -> String {
        format!("{}/api/{}", self.config.api_base_url, kind.as_str())
    }
}

/// Maps non-success statuses into the error taxonomy.
async fn classify_status(resp: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(SyncError::Auth(format!("ledger returned {status}")))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30));
            Err(SyncError::RateLimited { retry_after })
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let body = resp.text().await.unwrap_or_default();
            Err(SyncError::Validation(format!("ledger rejected payload: {body}")))
        }
        StatusCode::NOT_FOUND => Err(SyncError::NotFound(format!("ledger returned {status}"))),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            Err(SyncError::Transient(format!("ledger returned {status}")))
        }
        s => Err(SyncError::Transient(format!("unexpected status {s}"))),
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn list_entities(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<EntityPage> {
        let token = self.bearer().await?;
        let url = self.entity_url(kind);
        let resp = self
            .send_with_retry(|| {
                let mut req = self.client.get(&url).bearer_auth(&token);
                if let Some(c) = cursor {
                    req = req.query(&[("cursor", c)]);
                }
                if let Some(since) = modified_since {
                    req = req.query(&[("modified_since", since.to_rfc3339())]);
                }
                req.query(&[("limit", self.config.page_size.to_string())])
            })
            .await?;
        debug!("listed {kind} page (cursor={cursor:?})");
        Ok(resp.json().await?)
    }

    async fn get_entity(&self, kind: EntityKind, remote_id: &str) -> SyncResult<RemoteEntity> {
        let token = self.bearer().await?;
        let url = format!("{}/{remote_id}", self.entity_url(kind));
        let resp = self
            .send_with_retry(|| self.client.get(&url).bearer_auth(&token))
            .await?;
        Ok(resp.json().await?)
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        payload: &serde_json::Value,
    ) -> SyncResult<String> {
        let token = self.bearer().await?;
        let url = self.entity_url(kind);
        let resp = self
            .send_with_retry(|| self.client.post(&url).bearer_auth(&token).json(payload))
            .await?;
        let created: CreateResponse = resp.json().await?;
        Ok(created.id)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        remote_id: &str,
        payload: &serde_json::Value,
    ) -> SyncResult<()> {
        let token = self.bearer().await?;
        let url = format!("{}/{remote_id}", self.entity_url(kind));
        self.send_with_retry(|| self.client.put(&url).bearer_auth(&token).json(payload))
            .await?;
        Ok(())
    }

    async fn refresh_token(&self, refresh_token: &str) -> SyncResult<TokenSet> {
        let url = format!("{}/oauth/token", self.config.api_base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            // Refresh token expired or revoked; reconnection required
            return Err(SyncError::Auth(
                "token refresh rejected: reconnection required".to_string(),
            ));
        }
        let resp = classify_status(resp).await?;
        let body: TokenResponse = resp.json().await?;
        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        })
    }
}
