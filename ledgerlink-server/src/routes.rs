//! HTTP routes for the control surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ledgerlink_sync::{SyncError, SyncOrchestrator};
use ledgerlink_types::{ConflictResolution, EntityKind, RunOutcome, SyncOptions};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub fn router(orchestrator: Arc<SyncOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", post(run_sync))
        .route("/sync/abort", post(abort_sync))
        .route("/sync/progress", get(progress_stream))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/:id/resolve", post(resolve_conflict))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

/// JSON error body with the right status per the engine's error taxonomy.
struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::Auth(_) => StatusCode::UNAUTHORIZED,
            SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::RunInProgress(_) => StatusCode::LOCKED,
            SyncError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SyncError::Connection(_) | SyncError::Transient(_) => StatusCode::BAD_GATEWAY,
            SyncError::Store(_) | SyncError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Triggers a sync run. 200 on clean completion, 409 when the run produced
/// conflicts, 500 when it aborted, 423 when an overlapping run holds the
/// scope.
async fn run_sync(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Json(options): Json<SyncOptions>,
) -> Result<Response, ApiError> {
    let report = orchestrator.sync(options, None).await?;
    let status = if report.outcome == RunOutcome::Aborted {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if !report.conflicts.is_empty() {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)).into_response())
}

/// Requests a cooperative stop of the running sync. The run checks the flag
/// between entities, so 202 means "stop requested", not "stopped".
async fn abort_sync(State(orchestrator): State<Arc<SyncOrchestrator>>) -> Response {
    orchestrator.request_abort();
    (StatusCode::ACCEPTED, Json(json!({ "status": "abort_requested" }))).into_response()
}

/// SSE stream of progress events with keep-alive heartbeats.
async fn progress_stream(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = orchestrator.progress_bus().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse_event) => Some(Ok(sse_event)),
            Err(e) => {
                warn!("failed to encode progress event: {e}");
                None
            }
        },
        // Slow consumer dropped events; the next snapshot catches it up.
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            warn!("progress subscriber lagged by {n} events");
            None
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

async fn list_conflicts(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conflicts = orchestrator.conflicts()?;
    Ok(Json(json!({ "conflicts": conflicts })))
}

#[derive(Deserialize)]
struct ResolveBody {
    resolution: ConflictResolution,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Resolves one conflicted entity. The id is `{kind}:{local_id}`.
async fn resolve_conflict(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ledgerlink_types::SyncState>, ApiError> {
    let (kind, local_id) = parse_conflict_id(&id)?;
    let state = orchestrator
        .resolve_conflict(kind, local_id, body.resolution, body.notes, body.user_id)
        .await?;
    Ok(Json(state))
}

fn parse_conflict_id(id: &str) -> Result<(EntityKind, &str), SyncError> {
    let (kind_str, local_id) = id
        .split_once(':')
        .ok_or_else(|| SyncError::Validation(format!("malformed conflict id {id:?}")))?;
    let kind = EntityKind::parse(kind_str)
        .ok_or_else(|| SyncError::Validation(format!("unknown entity kind {kind_str:?}")))?;
    if local_id.is_empty() {
        return Err(SyncError::Validation(format!("malformed conflict id {id:?}")));
    }
    Ok((kind, local_id))
}
