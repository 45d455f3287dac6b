use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;
use crate::engine::Dispatch;
use crate::error::AgentError;
use crate::models::{AgentResponse, QueryBody, QueryRequest};
use crate::state::AppState;

// Set by the auth layer in front of this service
pub const USER_HEADER: &str = "x-user-id";

#[derive(Deserialize, Debug)]
pub struct ActionParams {
    pub action: Option<String>,
}

fn caller(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            let body = json!({
                "message": "Please sign in to ask about your spending.",
                "error": "Unauthorized",
            });
            (StatusCode::UNAUTHORIZED, Json(body)).into_response()
        })
}

fn rejection(err: &AgentError) -> Response {
    let status = match err {
        AgentError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(AgentResponse::failure(err, 0))).into_response()
}

// POST /agent/query
pub async fn query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Response {
    let user_id = match caller(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match state.engine.handle(QueryRequest::from_body(body, user_id)).await {
        Ok(Dispatch::Response(response)) => {
            let status = if response.is_error() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(response)).into_response()
        }
        Ok(Dispatch::Stream(events)) => {
            // one JSON event per line
            let body = Body::from_stream(events.map(|event| Ok::<_, Infallible>(event.to_line())));
            (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response()
        }
        Err(err) => rejection(&err),
    }
}

// GET /agent/query?action=...
pub async fn action_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ActionParams>,
) -> Response {
    let user_id = match caller(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match params.action.as_deref() {
        Some("cache-stats") => Json(json!({ "stats": state.cache.stats() })).into_response(),
        Some("clear-cache") => {
            let removed = state.engine.clear_user_cache(&user_id);
            info!(user_id = %user_id, removed, "user cache cleared");
            Json(json!({ "message": "Cache cleared" })).into_response()
        }
        other => {
            let body = json!({
                "message": "Unknown action",
                "error": format!("Unsupported action: {}", other.unwrap_or("<none>")),
            });
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}
