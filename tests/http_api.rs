use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use receipt_query_agent::analytics::{AnalyticsBackend, AnalyticsFunction};
use receipt_query_agent::cache::ResponseCache;
use receipt_query_agent::engine::{EngineConfig, QueryDispatchEngine};
use receipt_query_agent::executor::FunctionExecutor;
use receipt_query_agent::handlers::{self, USER_HEADER};
use receipt_query_agent::state::AppState;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;

struct FixedBackend {
    answer: Option<Value>,
    calls: AtomicUsize,
}

impl FixedBackend {
    fn new(answer: Option<Value>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AnalyticsBackend for FixedBackend {
    async fn call(&self, _function: AnalyticsFunction, _user_id: &str, _params: &Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().ok_or_else(|| anyhow::anyhow!("analytics offline"))
    }
}

fn app(backend: Arc<FixedBackend>) -> Router {
    let cache = Arc::new(ResponseCache::default());
    let executor = Arc::new(FunctionExecutor::new(backend));
    let engine = Arc::new(QueryDispatchEngine::new(cache, executor, EngineConfig::default()));
    handlers::router(Arc::new(AppState::new(engine)))
}

fn post(user: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/agent/query")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(USER_HEADER, user)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, bytes) = send(app, request).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn query_returns_answer_then_cached_answer() {
    let backend = FixedBackend::new(Some(json!(45.92)));
    let app = app(backend.clone());
    let body = json!({"query": "How much did I spend at Chick-fil-A?"});

    let (status, first) = send_json(&app, post(Some("U1"), body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["total"], json!(45.92));
    assert_eq!(first["cached"], json!(false));
    assert!(first["executionTime"].is_u64());
    assert!(first.get("error").is_none());

    let (_, second) = send_json(&app, post(Some("U1"), body)).await;
    assert_eq!(second["cached"], json!(true));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let app = app(FixedBackend::new(Some(json!(1))));
    let (status, body) = send_json(&app, post(Some("U1"), json!({"query": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn missing_user_is_unauthorized() {
    let app = app(FixedBackend::new(Some(json!(1))));
    let (status, _) = send_json(&app, post(None, json!({"query": "coffee"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn analytics_failure_is_a_500_with_message() {
    let app = app(FixedBackend::new(None));
    let (status, body) = send_json(&app, post(Some("U1"), json!({"query": "coffee"}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("analytics offline"));
    assert!(!body["message"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn streaming_query_is_newline_delimited_events() {
    let app = app(FixedBackend::new(Some(json!(12))));
    let (status, headers, bytes) =
        send(&app, post(Some("U1"), json!({"query": "coffee this month", "streaming": true}))).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));

    let text = String::from_utf8(bytes).unwrap();
    let events: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(events.first().unwrap()["type"], "start");
    assert_eq!(events.last().unwrap()["type"], "complete");
    assert_eq!(events.last().unwrap()["response"]["data"]["total"], json!(12.0));
    assert!(events.iter().any(|e| e["type"] == "tool_call"));
}

#[tokio::test]
async fn cache_stats_and_clear_cache() {
    let backend = FixedBackend::new(Some(json!(3)));
    let app = app(backend.clone());
    send_json(&app, post(Some("U1"), json!({"query": "gas last month"}))).await;
    send_json(&app, post(Some("U2"), json!({"query": "gas last month"}))).await;

    let (status, stats) = send_json(&app, get("/agent/query?action=cache-stats", "U1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["stats"]["size"], json!(2));
    assert_eq!(stats["stats"]["userSpecificEntries"], json!(2));

    let (status, cleared) = send_json(&app, get("/agent/query?action=clear-cache", "U1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["message"], "Cache cleared");

    let (_, again) = send_json(&app, post(Some("U1"), json!({"query": "gas last month"}))).await;
    assert_eq!(again["cached"], json!(false));
    let (_, other) = send_json(&app, post(Some("U2"), json!({"query": "gas last month"}))).await;
    assert_eq!(other["cached"], json!(true));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unknown_action_is_bad_request() {
    let app = app(FixedBackend::new(Some(json!(1))));
    let (status, _) = send_json(&app, get("/agent/query?action=explode", "U1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_metrics() {
    let app = app(FixedBackend::new(Some(json!(1))));

    let (status, health) = send_json(&app, get("/health", "U1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["timestamp"].is_string());
    assert!(health["cache"]["memoryUsage"].is_u64());

    send_json(&app, post(Some("U1"), json!({"query": "coffee"}))).await;
    let (status, _, bytes) = send(&app, get("/metrics", "U1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(bytes).unwrap().contains("agent_requests_total"));
}
