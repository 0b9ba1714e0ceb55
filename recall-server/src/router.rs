use recall_core::ipc::{RecallRequest, RecallResponse};
use recall_core::{ContextOptions, SessionQuery};

use crate::AppState;

/// Upper bound on `max_results` accepted from clients.
pub const MAX_RESULTS_LIMIT: usize = 50;

/// Sessions returned by `list` when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Upper bound on `limit` for `list`.
pub const MAX_LIST_LIMIT: usize = 200;

/// Dispatch one request against the shared repository. Errors become
/// `status: "error"` responses carrying the error kind.
pub async fn handle_request(request: RecallRequest, state: &AppState) -> RecallResponse {
    let repo = &state.repo;
    match request {
        RecallRequest::Ping => RecallResponse::pong(),
        RecallRequest::Health => {
            let store = match repo.health().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "Health check failed");
                    return RecallResponse::from_error(&e);
                }
            };
            let sessions = match repo.count().await {
                Ok(n) => n,
                Err(e) => return RecallResponse::from_error(&e),
            };
            RecallResponse::ok(serde_json::json!({
                "status": "healthy",
                "store": store,
                "backend": state.config.store.backend,
                "collection": repo.collection(),
                "sessions": sessions,
                "embedding": repo.embedder_name(),
                "dimensions": repo.dimensions(),
            }))
        }
        RecallRequest::Save { draft } => match repo.save(draft).await {
            Ok(id) => RecallResponse::ok(serde_json::json!({ "session_id": id })),
            Err(e) => {
                tracing::error!(error = %e, "Save failed");
                RecallResponse::from_error(&e)
            }
        },
        RecallRequest::Query { query } => {
            let query = clamp(query);
            match repo.query(&query).await {
                Ok(results) => RecallResponse::ok(serde_json::json!({
                    "query": query.text,
                    "count": results.len(),
                    "results": results,
                })),
                Err(e) => RecallResponse::from_error(&e),
            }
        }
        RecallRequest::Context { query, max_chars } => {
            let query = clamp(query);
            let options = ContextOptions {
                header: state.config.retrieval.header.clone(),
                max_chars: max_chars.unwrap_or(state.config.retrieval.excerpt_chars),
            };
            match repo.context(&query, &options).await {
                Ok(context) => RecallResponse::ok(serde_json::json!({
                    "empty": context.is_empty(),
                    "context": context,
                })),
                Err(e) => RecallResponse::from_error(&e),
            }
        }
        RecallRequest::List { filter, limit } => {
            let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
            match repo.list(&filter, limit).await {
                Ok(sessions) => RecallResponse::ok(serde_json::json!({
                    "count": sessions.len(),
                    "sessions": sessions,
                })),
                Err(e) => RecallResponse::from_error(&e),
            }
        }
        RecallRequest::Get { id } => match repo.get_by_id(&id).await {
            Ok(session) => RecallResponse::ok(serde_json::json!({ "session": session })),
            Err(e) => RecallResponse::from_error(&e),
        },
        RecallRequest::Delete { id } => match repo.delete_by_id(&id).await {
            Ok(deleted) => RecallResponse::ok(serde_json::json!({
                "session_id": id,
                "deleted": deleted,
            })),
            Err(e) => RecallResponse::from_error(&e),
        },
    }
}

fn clamp(mut query: SessionQuery) -> SessionQuery {
    query.max_results = query.max_results.clamp(1, MAX_RESULTS_LIMIT);
    query
}
