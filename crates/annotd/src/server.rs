//! HTTP control plane for annotd.
//!
//! JSON REST endpoints for documents, runs and per-block transitions, plus a
//! server-sent event stream per run. Bound to 127.0.0.1 only.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use annot_core::events::ResyncPayload;
use annot_core::{Block, BlockOverlay, Id, Run, StreamEvent};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::{CreateRunRequest, Engine, EngineError};
use crate::fanout::FanoutHub;

/// Requester recorded on regenerate claims when the caller names none. Such
/// claims get a zero lease so the next worker ClaimNext takes the block.
const DEFAULT_REGENERATE_ACTOR: &str = "regenerate";

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: Arc<FanoutHub>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/documents/{conv_uid}/blocks",
            put(import_blocks).get(list_blocks),
        )
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/claim", post(claim))
        .route("/runs/{id}/confirm", post(confirm_all))
        .route("/runs/{id}/overlays", get(list_overlays))
        .route("/runs/{id}/snapshot", get(snapshot))
        .route("/runs/{id}/export", get(export_run))
        .route("/runs/{id}/audit", post(audit_run))
        .route("/runs/{id}/blocks/{uid}", get(get_overlay))
        .route("/runs/{id}/blocks/{uid}/claim", post(claim_block))
        .route("/runs/{id}/blocks/{uid}/success", post(report_success))
        .route("/runs/{id}/blocks/{uid}/failure", post(report_failure))
        .route("/runs/{id}/blocks/{uid}/confirm", post(confirm_block))
        .route("/runs/{id}/blocks/{uid}/staging", put(edit_staging))
        .route("/runs/{id}/blocks/{uid}/regenerate", post(regenerate))
        .route("/runs/{id}/blocks/{uid}/reopen", post(reopen))
        // SSE
        .route("/runs/{id}/subscribe", get(subscribe))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid auth token",
        )),
        None => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing auth token",
        )),
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

/// Map an engine error onto its HTTP status and stable error code.
fn api_error(err: EngineError) -> ApiError {
    let (status, code) = match &err {
        EngineError::StaleStateConflict(_) => (StatusCode::CONFLICT, "stale_state_conflict"),
        EngineError::RetryLimitExceeded(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "retry_limit_exceeded")
        }
        EngineError::RunCancelled(_) => (StatusCode::GONE, "run_cancelled"),
        EngineError::RunNotFound(_) => (StatusCode::NOT_FOUND, "run_not_found"),
        EngineError::OverlayNotFound(_) => (StatusCode::NOT_FOUND, "overlay_not_found"),
        EngineError::NoBlocks(_) => (StatusCode::BAD_REQUEST, "no_blocks"),
        EngineError::InvalidTransition(_) => (StatusCode::BAD_REQUEST, "invalid_transition"),
        EngineError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        EngineError::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        EngineError::Storage(_) => {
            error!("storage failure: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
        }
    };
    error_response(status, code, err.to_string())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportBlocksRequest {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportBlocksResponse {
    pub imported: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListBlocksResponse {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub conv_uid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub run: Run,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OverlayResponse {
    pub overlay: BlockOverlay,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OverlaysResponse {
    pub overlays: Vec<BlockOverlay>,
}

/// Body for POST /runs/{id}/claim. A `batch_size` selects a batch claim.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Lease for this claim; the configured lease when absent.
    #[serde(default)]
    pub lease_sec: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimBlockRequest {
    pub worker_id: String,
    #[serde(default)]
    pub lease_sec: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportSuccessRequest {
    /// Attempt number returned by the claim.
    pub attempt: u32,
    pub staging_payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportFailureRequest {
    pub attempt: u32,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub confirmed_by: String,
    /// Replaces the staging payload before confirming.
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmAllRequest {
    pub confirmed_by: String,
    #[serde(default)]
    pub block_uids: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditStagingRequest {
    pub payload: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub requested_by: Option<String>,
    /// How long the requester holds the new attempt. `0` hands it to workers.
    #[serde(default)]
    pub lease_sec: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReopenRequest {
    pub requested_by: String,
    #[serde(default)]
    pub lease_sec: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AuditQuery {
    #[serde(default)]
    pub repair: bool,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// PUT /documents/{conv_uid}/blocks - Import blocks; existing ones are kept.
async fn import_blocks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conv_uid): Path<String>,
    Json(req): Json<ImportBlocksRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let imported = state
        .engine
        .import_blocks(&conv_uid, req.blocks)
        .await
        .map_err(api_error)?;
    Ok(Json(ImportBlocksResponse { imported }))
}

async fn list_blocks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conv_uid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let blocks = state
        .engine
        .list_blocks(&conv_uid)
        .await
        .map_err(api_error)?;
    Ok(Json(ListBlocksResponse { blocks }))
}

/// POST /runs - Start a run over a document's blocks.
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let run = state.engine.create_run(req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(RunResponse { run })))
}

/// GET /runs - List runs, optionally for one document.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let runs = state
        .engine
        .list_runs(query.conv_uid.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(ListRunsResponse { runs }))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .engine
        .get_run(&Id::from_string(id))
        .await
        .map_err(api_error)?;
    Ok(Json(RunResponse { run }))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(id);
    state.engine.delete_run(&run_id).await.map_err(api_error)?;
    state.hub.remove(&run_id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .engine
        .cancel_run(&Id::from_string(id))
        .await
        .map_err(api_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/claim - Claim the next block, or a batch. 204 when there
/// is nothing to claim.
async fn claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<axum::response::Response, ApiError> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(id);
    let lease = req.lease_sec.map(Duration::from_secs);

    if req.batch_size.is_some() {
        let overlays = state
            .engine
            .claim_batch(&run_id, &req.worker_id, req.batch_size, lease)
            .await
            .map_err(api_error)?;
        if overlays.is_empty() {
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        return Ok(Json(OverlaysResponse { overlays }).into_response());
    }

    match state
        .engine
        .claim_next(&run_id, &req.worker_id, lease)
        .await
        .map_err(api_error)?
    {
        Some(overlay) => Ok(Json(OverlayResponse { overlay }).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn confirm_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ConfirmAllRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let summary = state
        .engine
        .confirm_all(&Id::from_string(id), &req.confirmed_by, req.block_uids)
        .await
        .map_err(api_error)?;
    Ok(Json(summary))
}

async fn list_overlays(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlays = state
        .engine
        .list_overlays(&Id::from_string(id))
        .await
        .map_err(api_error)?;
    Ok(Json(OverlaysResponse { overlays }))
}

async fn snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let snapshot = state
        .engine
        .snapshot(&Id::from_string(id))
        .await
        .map_err(api_error)?;
    Ok(Json(snapshot))
}

/// GET /runs/{id}/export - One JSON record per block, newline delimited.
async fn export_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let records = state
        .engine
        .export(&Id::from_string(id))
        .await
        .map_err(api_error)?;

    let mut body = String::new();
    for record in &records {
        let line = serde_json::to_string(record).map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_error",
                e.to_string(),
            )
        })?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body))
}

async fn audit_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let report = state
        .engine
        .audit(&Id::from_string(id), query.repair)
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

async fn get_overlay(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .get_overlay(&Id::from_string(id), &uid)
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn claim_block(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<ClaimBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .claim_block(
            &Id::from_string(id),
            &uid,
            &req.worker_id,
            req.lease_sec.map(Duration::from_secs),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn report_success(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<ReportSuccessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .report_success(&Id::from_string(id), &uid, req.attempt, req.staging_payload)
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn report_failure(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<ReportFailureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .report_failure(&Id::from_string(id), &uid, req.attempt, req.error)
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn confirm_block(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .confirm(&Id::from_string(id), &uid, &req.confirmed_by, req.payload)
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn edit_staging(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<EditStagingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .edit_staging(&Id::from_string(id), &uid, req.payload)
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn regenerate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<RegenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let (requested_by, lease) = match req.requested_by {
        Some(by) => (by, req.lease_sec.map(Duration::from_secs)),
        None => (
            DEFAULT_REGENERATE_ACTOR.to_string(),
            Some(Duration::from_secs(req.lease_sec.unwrap_or(0))),
        ),
    };
    let overlay = state
        .engine
        .regenerate(&Id::from_string(id), &uid, &requested_by, lease)
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

async fn reopen(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, uid)): Path<(String, String)>,
    Json(req): Json<ReopenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let overlay = state
        .engine
        .reopen(
            &Id::from_string(id),
            &uid,
            &req.requested_by,
            req.lease_sec.map(Duration::from_secs),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(OverlayResponse { overlay }))
}

// --- SSE ---

/// None when the payload does not serialize; the frame is skipped.
fn to_sse(event: &StreamEvent) -> Option<Result<SseEvent, Infallible>> {
    let json = match event.data_json() {
        Ok(json) => json,
        Err(e) => {
            error!(event = event.event_type().as_str(), "failed to encode stream event: {}", e);
            return None;
        }
    };
    let mut sse = SseEvent::default()
        .event(event.event_type().as_str())
        .data(json);
    if let StreamEvent::Transition(t) = event {
        sse = sse.id(t.seq.to_string());
    }
    Some(Ok(sse))
}

/// GET /runs/{id}/subscribe - A `snapshot` event, then one `transition`
/// event per commit. A subscriber that falls behind gets `resync` and the
/// stream ends.
async fn subscribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(id);

    // Subscribe before reading the snapshot so no commit falls between them.
    let rx = state.hub.subscribe(&run_id).await;
    let snapshot = state.engine.snapshot(&run_id).await.map_err(api_error)?;
    let floor = snapshot.seq;
    info!(run_id = %run_id, seq = floor, "subscriber attached");

    let first = to_sse(&StreamEvent::Snapshot(snapshot));
    let updates = stream::unfold(Some((rx, run_id)), move |cursor| async move {
        let (mut rx, run_id) = cursor?;
        loop {
            match rx.recv().await {
                // Already reflected in the snapshot.
                Ok(event) if event.seq <= floor => {}
                Ok(event) => {
                    if let Some(sse) = to_sse(&StreamEvent::Transition(event)) {
                        return Some((sse, Some((rx, run_id))));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run_id = %run_id, skipped, "subscriber lagged, requesting resync");
                    let sse = to_sse(&StreamEvent::Resync(ResyncPayload {
                        run_id: run_id.clone(),
                        reason: format!("missed {skipped} transitions"),
                    }))?;
                    return Some((sse, None));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::iter(first).chain(updates);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use annot_core::EngineConfig;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn create_test_app(auth_token: Option<&str>) -> (Router, Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let engine = Arc::new(Engine::new(Arc::new(storage), EngineConfig::default()));

        let state = Arc::new(AppState {
            engine,
            hub: Arc::new(FanoutHub::new(16)),
            auth_token: auth_token.map(str::to_string),
        });

        let router = create_router(Arc::clone(&state));
        (router, state, dir)
    }

    fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap()
    }

    async fn body_to_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_run(state: &AppState, blocks: usize) -> Id {
        let blocks = (0..blocks)
            .map(|i| Block {
                block_uid: format!("b{i}"),
                block_index: i as i64,
                block_type: "paragraph".to_string(),
                content: format!("text {i}"),
            })
            .collect();
        state.engine.import_blocks("doc", blocks).await.unwrap();
        state
            .engine
            .create_run(CreateRunRequest {
                conv_uid: "doc".to_string(),
                schema_id: "s1".to_string(),
                model_config: None,
                max_attempts: None,
            })
            .await
            .unwrap()
            .run_id
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (app, _, _dir) = create_test_app(None).await;

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_token_is_enforced() {
        let (app, _, _dir) = create_test_app(Some("secret")).await;

        let response: Response = app
            .clone()
            .oneshot(Request::builder().uri("/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_to_json(response).await;
        assert_eq!(json["code"], "unauthorized");

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/runs")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_without_blocks_is_rejected() {
        let (app, _, _dir) = create_test_app(None).await;
        let body = serde_json::json!({ "conv_uid": "empty", "schema_id": "s1" });

        let response: Response = app.oneshot(json_request("POST", "/runs", &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_to_json(response).await["code"], "no_blocks");
    }

    #[tokio::test]
    async fn claim_returns_no_content_when_drained() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 1).await;
        let uri = format!("/runs/{run_id}/claim");
        let body = serde_json::json!({ "worker_id": "w1" });

        let response: Response = app
            .clone()
            .oneshot(json_request("POST", &uri, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_to_json(response).await;
        assert_eq!(json["overlay"]["status"], "claimed");
        assert_eq!(json["overlay"]["attempt_count"], 1);

        let response: Response = app.oneshot(json_request("POST", &uri, &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn stale_report_maps_to_conflict() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 1).await;
        state.engine.claim_next(&run_id, "w1", None).await.unwrap();

        let body = serde_json::json!({ "attempt": 2, "staging_payload": {"x": 1} });
        let response: Response = app
            .oneshot(json_request(
                "POST",
                &format!("/runs/{run_id}/blocks/b0/success"),
                &body,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_to_json(response).await["code"], "stale_state_conflict");
    }

    #[tokio::test]
    async fn regenerate_on_cancelled_run_is_gone() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 1).await;
        state.engine.claim_next(&run_id, "w1", None).await.unwrap();
        state
            .engine
            .report_success(&run_id, "b0", 1, serde_json::json!({"x": 1}))
            .await
            .unwrap();
        state.engine.cancel_run(&run_id).await.unwrap();

        let response: Response = app
            .oneshot(json_request(
                "POST",
                &format!("/runs/{run_id}/blocks/b0/regenerate"),
                &serde_json::json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(body_to_json(response).await["code"], "run_cancelled");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (app, _, _dir) = create_test_app(None).await;

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/runs/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_to_json(response).await["code"], "run_not_found");
    }

    #[tokio::test]
    async fn export_is_newline_delimited() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 2).await;
        state.engine.claim_next(&run_id, "w1", None).await.unwrap();
        state
            .engine
            .report_success(&run_id, "b0", 1, serde_json::json!({"label": "a"}))
            .await
            .unwrap();
        state.engine.confirm(&run_id, "b0", "alice", None).await.unwrap();

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{run_id}/export"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-ndjson"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["data"]["label"], "a");
        assert_eq!(lines[0]["overlay_status"], "confirmed");
        assert_eq!(lines[1]["data"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn claim_carries_requested_lease() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 2).await;
        let uri = format!("/runs/{run_id}/claim");

        let body = serde_json::json!({ "worker_id": "w1", "lease_sec": 5 });
        let response: Response = app
            .clone()
            .oneshot(json_request("POST", &uri, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_to_json(response).await["overlay"]["lease_ms"], 5000);

        let body = serde_json::json!({ "worker_id": "w1" });
        let response: Response = app.oneshot(json_request("POST", &uri, &body)).await.unwrap();
        let json = body_to_json(response).await;
        assert_eq!(json["overlay"]["lease_ms"], 300_000);
    }

    #[tokio::test]
    async fn anonymous_regenerate_goes_back_to_workers() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 1).await;
        state.engine.claim_next(&run_id, "w1", None).await.unwrap();
        state
            .engine
            .report_success(&run_id, "b0", 1, serde_json::json!({"x": 1}))
            .await
            .unwrap();

        let response: Response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/runs/{run_id}/blocks/b0/regenerate"),
                &serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_to_json(response).await;
        assert_eq!(json["overlay"]["claimed_by"], DEFAULT_REGENERATE_ACTOR);
        assert_eq!(json["overlay"]["lease_ms"], 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let response: Response = app
            .oneshot(json_request(
                "POST",
                &format!("/runs/{run_id}/claim"),
                &serde_json::json!({ "worker_id": "w2" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_to_json(response).await;
        assert_eq!(json["overlay"]["claimed_by"], "w2");
        assert_eq!(json["overlay"]["attempt_count"], 3);
    }

    #[tokio::test]
    async fn delete_run_drops_its_channel() {
        let (app, state, _dir) = create_test_app(None).await;
        let run_id = seed_run(&state, 1).await;
        let _rx = state.hub.subscribe(&run_id).await;
        assert_eq!(state.hub.channel_count().await, 1);

        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.hub.channel_count().await, 0);
    }

    #[test]
    fn stream_events_become_frames() {
        let event = StreamEvent::Resync(ResyncPayload {
            run_id: Id::from_string("r1".to_string()),
            reason: "missed 3 transitions".to_string(),
        });
        let frame = to_sse(&event);
        assert!(matches!(frame, Some(Ok(_))));
    }
}
