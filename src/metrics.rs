use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("agent_requests_total", "Total number of agent queries").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("agent_cache_hits_total", "Total response cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("agent_cache_misses_total", "Total response cache misses").unwrap();
    pub static ref TOOL_CALLS: Counter =
        register_counter!("agent_tool_calls_total", "Total analytics function invocations").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "agent_request_latency_seconds",
        "Query latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("agent_cache_size", "Current number of entries in the response cache").unwrap();
}

// Render every registered metric in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
