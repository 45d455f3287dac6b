use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;
use crate::state::AppState;

// health handler, overall status follows the response cache
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache.health();
    Json(serde_json::json!({
        "status": cache.status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "llm": state.engine.llm_enabled(),
        "cache": cache,
    }))
}
