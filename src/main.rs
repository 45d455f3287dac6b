use anyhow::Context;
use clap::Parser;
use receipt_query_agent::analytics::HttpAnalyticsBackend;
use receipt_query_agent::cache::ResponseCache;
use receipt_query_agent::config::Args;
use receipt_query_agent::engine::QueryDispatchEngine;
use receipt_query_agent::executor::FunctionExecutor;
use receipt_query_agent::handlers;
use receipt_query_agent::llm::OpenAiChatClient;
use receipt_query_agent::state::AppState;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();
    init_tracing(args.log_json);

    let client = reqwest::Client::new();
    let backend = Arc::new(HttpAnalyticsBackend::new(client.clone(), &args.analytics_url));
    let executor = Arc::new(FunctionExecutor::new(backend));

    let cache = Arc::new(ResponseCache::new(args.cache_config()));
    cache.start_sweeper();

    let mut engine = QueryDispatchEngine::new(Arc::clone(&cache), executor, args.engine_config());
    match args.llm_api_key.as_deref() {
        Some(key) if !key.is_empty() => {
            let model = OpenAiChatClient::new(client, &args.llm_url, &args.llm_model, key);
            engine = engine.with_model(Arc::new(model));
            info!(model = %args.llm_model, url = %args.llm_url, "LLM reasoning enabled");
        }
        _ => warn!("no LLM API key configured, keyword routing only"),
    }

    let state = Arc::new(AppState::new(Arc::new(engine)));
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        port = args.port,
        analytics = %args.analytics_url,
        cache_ttl = args.cache_ttl,
        max_tool_turns = args.max_tool_turns,
        "query agent listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cache.dispose();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
