mod health;
mod metrics;
mod query;

use axum::{Router, routing::get};
use std::sync::Arc;
use crate::state::AppState;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use query::{USER_HEADER, action_handler, query_handler};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agent/query", get(action_handler).post(query_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
