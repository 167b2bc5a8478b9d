use chrono::{Duration, Utc};
use ledgerlink_sync::{HttpLedgerClient, SyncConfig, SyncError, TokenRefreshService};
use ledgerlink_types::TokenSet;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn tokens_expiring_in(secs: i64) -> TokenSet {
    TokenSet {
        access_token: "at-old".into(),
        refresh_token: "rt-old".into(),
        expires_at: Utc::now() + Duration::seconds(secs),
    }
}

async fn setup(server: &MockServer, margin_secs: i64) -> Arc<TokenRefreshService> {
    let client = Arc::new(HttpLedgerClient::new(SyncConfig::for_base_url(server.uri())).unwrap());
    let bearer = client.bearer_slot();
    Arc::new(TokenRefreshService::new(client, bearer, margin_secs))
}

fn refresh_response() -> serde_json::Value {
    serde_json::json!({
        "access_token": "at-new",
        "refresh_token": "rt-new",
        "expires_in": 1800
    })
}

#[tokio::test]
async fn valid_token_is_returned_without_refresh() {
    let server = MockServer::start().await;
    // No mock mounted: any refresh attempt would fail loudly.
    let service = setup(&server, 600).await;
    service.install(tokens_expiring_in(7200)).await;

    let tokens = service.ensure_valid().await.unwrap();
    assert_eq!(tokens.access_token, "at-old");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn token_inside_margin_is_refreshed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_response()))
        .expect(1)
        .mount(&server)
        .await;

    let service = setup(&server, 600).await;
    service.install(tokens_expiring_in(300)).await;

    let tokens = service.ensure_valid().await.unwrap();
    assert_eq!(tokens.access_token, "at-new");
    assert_eq!(tokens.refresh_token, "rt-new");
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    // The provider rotates the refresh token per use: a second exchange with
    // the old token would be fatal, so exactly one call may go out.
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(refresh_response())
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let service = setup(&server, 600).await;
    service.install(tokens_expiring_in(10)).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let svc = service.clone();
            tokio::spawn(async move { svc.ensure_valid().await })
        })
        .collect();
    for handle in handles {
        let tokens = handle.await.unwrap().unwrap();
        assert_eq!(tokens.access_token, "at-new");
    }
}

#[tokio::test]
async fn force_refresh_ignores_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_response()))
        .expect(1)
        .mount(&server)
        .await;

    let service = setup(&server, 600).await;
    service.install(tokens_expiring_in(7200)).await;

    let tokens = service.force_refresh().await.unwrap();
    assert_eq!(tokens.access_token, "at-new");
}

#[tokio::test]
async fn dead_refresh_token_clears_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let service = setup(&server, 600).await;
    service.install(tokens_expiring_in(10)).await;

    let result = service.ensure_valid().await;
    assert!(matches!(result.unwrap_err(), SyncError::Auth(_)));
    assert!(service.current().await.is_none());
}

#[tokio::test]
async fn ensure_valid_without_credentials_is_auth() {
    let server = MockServer::start().await;
    let service = setup(&server, 600).await;
    let result = service.ensure_valid().await;
    assert!(matches!(result.unwrap_err(), SyncError::Auth(_)));
}
