use std::sync::Arc;
use crate::cache::ResponseCache;
use crate::engine::QueryDispatchEngine;

// app's shared state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryDispatchEngine>,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(engine: Arc<QueryDispatchEngine>) -> Self {
        let cache = Arc::clone(engine.cache());
        Self { engine, cache }
    }
}
