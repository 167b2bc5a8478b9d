//! LedgerLink control server.
//!
//! Hosts the HTTP surface for triggering sync runs, streaming progress, and
//! resolving conflicts. The engine itself lives in `ledgerlink-sync`; this
//! binary wires it to a database path and ledger credentials and serves it.

mod routes;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use ledgerlink_store::LocalStore;
use ledgerlink_sync::{HttpLedgerClient, SyncConfig, SyncOrchestrator, TokenRefreshService};
use ledgerlink_types::TokenSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ledgerlink-server", about = "LedgerLink sync control server")]
struct Args {
    /// Path to the local database.
    #[arg(long, env = "LEDGERLINK_DB", default_value = "ledgerlink.db")]
    database: PathBuf,

    /// Base URL of the remote ledger API.
    #[arg(long, env = "LEDGER_API_URL")]
    api_base_url: String,

    /// Integration identifier, scopes run locks and credentials.
    #[arg(long, env = "LEDGER_INTEGRATION_ID", default_value = "default")]
    integration_id: String,

    /// OAuth2 refresh token for the ledger connection.
    #[arg(long, env = "LEDGER_REFRESH_TOKEN")]
    refresh_token: String,

    /// Listen address.
    #[arg(long, env = "LEDGERLINK_LISTEN", default_value = "127.0.0.1:8415")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args = Args::parse();

    let store = LocalStore::open(&args.database)
        .with_context(|| format!("opening database at {}", args.database.display()))?;

    let config = SyncConfig {
        api_base_url: args.api_base_url.clone(),
        integration_id: args.integration_id.clone(),
        ..SyncConfig::default()
    };
    let client = Arc::new(HttpLedgerClient::new(config.clone()).context("building ledger client")?);
    let tokens = Arc::new(TokenRefreshService::new(
        client.clone(),
        client.bearer_slot(),
        config.token_refresh_margin_secs,
    ));
    // Only the refresh token survives restarts; the first run exchanges it
    // for a fresh access token.
    tokens
        .install(TokenSet {
            access_token: String::new(),
            refresh_token: args.refresh_token.clone(),
            expires_at: Utc::now(),
        })
        .await;

    let orchestrator = Arc::new(SyncOrchestrator::new(store, client, tokens, config));
    let app = routes::router(orchestrator);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("listening on http://{}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
