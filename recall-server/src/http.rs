//! Recall HTTP REST API
//!
//! Axum server exposing the session repository next to the Unix socket IPC
//! server (port 8767 by default). Every handler is a thin wrapper over an
//! inner function that builds a `RecallRequest`, runs it through the shared
//! router and maps the response to a status code and JSON body.
//!
//! Endpoints:
//! - GET    /health        store and embedding status
//! - GET    /version       server version info
//! - POST   /sessions      save a session
//! - GET    /sessions      list sessions (filters as query params)
//! - GET    /sessions/:id  fetch one session
//! - DELETE /sessions/:id  delete one session
//! - POST   /search        ranked semantic search
//! - POST   /context       formatted context block for prompt injection

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use recall_core::ipc::{RecallRequest, RecallResponse};
use recall_core::{ErrorKind, SessionDraft, SessionFilter, SessionQuery};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::{router, AppState};

pub const PROTOCOL: &str = "recall/1";

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", post(save_handler).get(list_handler))
        .route("/sessions/:id", get(get_handler).delete(delete_handler))
        .route("/search", post(search_handler))
        .route("/context", post(context_handler))
        .with_state(state)
}

/// Serve the API on `[http] host:port` until the shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Recall HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub agent_name: Option<String>,
    pub workflow: Option<String>,
    pub project_name: Option<String>,
    pub max_results: Option<usize>,
    pub min_relevance: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextRequest {
    pub query: Option<String>,
    pub agent_name: Option<String>,
    pub workflow: Option<String>,
    pub project_name: Option<String>,
    pub max_sessions: Option<usize>,
    pub min_relevance: Option<f32>,
    pub max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub agent_name: Option<String>,
    pub workflow: Option<String>,
    pub project_name: Option<String>,
    pub limit: Option<usize>,
}

/// Standard HTTP error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_kind: Option<ErrorKind>,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(kind: Option<ErrorKind>, msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            error_kind: kind,
            status: "error".to_string(),
        }
    }

    fn into_body(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"status": "error"}))
    }
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn health_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    let response = router::handle_request(RecallRequest::Health, state).await;
    match response_to_http(response) {
        Ok(mut data) => {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("version".into(), serde_json::json!(env!("CARGO_PKG_VERSION")));
                obj.insert(
                    "socket".into(),
                    serde_json::json!(state.config.service.socket_path),
                );
            }
            (StatusCode::OK, data)
        }
        Err((_, body)) => (StatusCode::SERVICE_UNAVAILABLE, with_unhealthy(body)),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL,
    })
}

pub async fn save_inner(state: &AppState, draft: SessionDraft) -> (StatusCode, serde_json::Value) {
    let response = router::handle_request(RecallRequest::Save { draft }, state).await;
    match response_to_http(response) {
        Ok(data) => (StatusCode::CREATED, data),
        Err(err) => err,
    }
}

pub async fn list_inner(state: &AppState, params: ListParams) -> (StatusCode, serde_json::Value) {
    let request = RecallRequest::List {
        filter: SessionFilter {
            agent_name: params.agent_name,
            workflow: params.workflow,
            project_name: params.project_name,
        },
        limit: params.limit,
    };
    dispatch(state, request).await
}

pub async fn get_inner(state: &AppState, id: String) -> (StatusCode, serde_json::Value) {
    dispatch(state, RecallRequest::Get { id }).await
}

pub async fn delete_inner(state: &AppState, id: String) -> (StatusCode, serde_json::Value) {
    dispatch(state, RecallRequest::Delete { id }).await
}

/// Ranked search. Omitted thresholds fall back to `[retrieval]` defaults.
pub async fn search_inner(state: &AppState, req: SearchRequest) -> (StatusCode, serde_json::Value) {
    let text = match req.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => return missing_query(),
    };

    let retrieval = &state.config.retrieval;
    let query = SessionQuery {
        text,
        filter: SessionFilter {
            agent_name: req.agent_name,
            workflow: req.workflow,
            project_name: req.project_name,
        },
        max_results: req.max_results.unwrap_or(retrieval.max_results),
        min_relevance: req.min_relevance.unwrap_or(0.0),
    };

    let start = Instant::now();
    let response = router::handle_request(RecallRequest::Query { query }, state).await;
    let took_ms = start.elapsed().as_millis() as u64;

    match response_to_http(response) {
        Ok(mut data) => {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("took_ms".to_string(), serde_json::json!(took_ms));
            }
            (StatusCode::OK, data)
        }
        Err(err) => err,
    }
}

pub async fn context_inner(
    state: &AppState,
    req: ContextRequest,
) -> (StatusCode, serde_json::Value) {
    let text = match req.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => return missing_query(),
    };

    let retrieval = &state.config.retrieval;
    let query = SessionQuery {
        text,
        filter: SessionFilter {
            agent_name: req.agent_name,
            workflow: req.workflow,
            project_name: req.project_name,
        },
        max_results: req.max_sessions.unwrap_or(retrieval.context_max_sessions),
        min_relevance: req.min_relevance.unwrap_or(retrieval.context_min_relevance),
    };

    let request = RecallRequest::Context {
        query,
        max_chars: req.max_chars,
    };
    dispatch(state, request).await
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn save_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<SessionDraft>,
) -> impl IntoResponse {
    let (status, body) = save_inner(&state, draft).await;
    (status, Json(body))
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let (status, body) = list_inner(&state, params).await;
    (status, Json(body))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = get_inner(&state, id).await;
    (status, Json(body))
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = delete_inner(&state, id).await;
    (status, Json(body))
}

pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> impl IntoResponse {
    let (status, body) = search_inner(&state, req).await;
    (status, Json(body))
}

pub async fn context_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextRequest>,
) -> impl IntoResponse {
    let (status, body) = context_inner(&state, req).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::DuplicateId => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Configuration | ErrorKind::CorruptRecord => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Split a `RecallResponse` into its data, or a status code and error body.
pub fn response_to_http(
    response: RecallResponse,
) -> std::result::Result<serde_json::Value, (StatusCode, serde_json::Value)> {
    if response.is_ok() {
        return Ok(response.data.unwrap_or(serde_json::json!({})));
    }
    let status = response
        .error_kind
        .map(status_for)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = response.error.unwrap_or_else(|| "unknown error".to_string());
    Err((status, ErrorResponse::new(response.error_kind, message).into_body()))
}

async fn dispatch(state: &AppState, request: RecallRequest) -> (StatusCode, serde_json::Value) {
    let response = router::handle_request(request, state).await;
    match response_to_http(response) {
        Ok(data) => (StatusCode::OK, data),
        Err(err) => err,
    }
}

fn missing_query() -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        ErrorResponse::new(Some(ErrorKind::InvalidArgument), "query field is required")
            .into_body(),
    )
}

fn with_unhealthy(mut body: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("status".into(), serde_json::json!("unhealthy"));
    }
    body
}
