use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use crate::cache::{ResponseCache, SetOptions, fingerprint};
use crate::error::AgentResult;
use crate::executor::{FunctionExecutor, NormalizedResult, response_data, summarize};
use crate::llm::ChatModel;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::{AgentResponse, FunctionCall, QueryRequest, ToolCallStatus};
use crate::orchestrator::{DEFAULT_MAX_TURNS, OrchestratorOutcome, ToolCallOrchestrator};
use crate::selector::{FunctionSelector, normalize_query};
use crate::streaming::{EventSink, EventStream, StreamingResponder, panic_response};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cache_ttl: Duration,
    pub max_tool_turns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            max_tool_turns: DEFAULT_MAX_TURNS,
        }
    }
}

pub enum Dispatch {
    Response(AgentResponse),
    Stream(EventStream),
}

/// Entry point for every query.
///
/// Validation errors are returned to the caller; anything that fails after
/// that comes back as an `AgentResponse` carrying `error`, or as the `error`
/// event of a stream.
pub struct QueryDispatchEngine {
    cache: Arc<ResponseCache>,
    selector: FunctionSelector,
    executor: Arc<FunctionExecutor>,
    orchestrator: Option<ToolCallOrchestrator>,
    responder: StreamingResponder,
    config: EngineConfig,
}

impl QueryDispatchEngine {
    pub fn new(cache: Arc<ResponseCache>, executor: Arc<FunctionExecutor>, config: EngineConfig) -> Self {
        Self {
            cache,
            selector: FunctionSelector::default(),
            executor,
            orchestrator: None,
            responder: StreamingResponder::default(),
            config,
        }
    }

    // Enable the LLM reasoning path
    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.orchestrator = Some(ToolCallOrchestrator::new(
            model,
            Arc::clone(&self.executor),
            self.config.max_tool_turns,
        ));
        self
    }

    pub fn with_selector(mut self, selector: FunctionSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn llm_enabled(&self) -> bool {
        self.orchestrator.is_some()
    }

    pub async fn handle(self: &Arc<Self>, request: QueryRequest) -> AgentResult<Dispatch> {
        if !request.streaming {
            return self.answer(request).await.map(Dispatch::Response);
        }

        REQUEST_TOTAL.inc();
        let normalized = normalize_query(request.validate()?);
        let engine = Arc::clone(self);
        let stream = self.responder.respond(move |sink| async move {
            engine.resolve(&request, &normalized, &sink).await
        });
        Ok(Dispatch::Stream(stream))
    }

    /// Answer without streaming, folding pipeline failures into the response.
    pub async fn answer(&self, request: QueryRequest) -> AgentResult<AgentResponse> {
        REQUEST_TOTAL.inc();
        let normalized = normalize_query(request.validate()?);

        let started = Instant::now();
        let sink = EventSink::detached();
        let outcome = AssertUnwindSafe(self.resolve(&request, &normalized, &sink))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                error!(user_id = %request.user_id, error = %err, "query failed");
                Ok(AgentResponse::failure(&err, elapsed_ms(started)))
            }
            Err(panic) => Ok(panic_response(panic, elapsed_ms(started))),
        }
    }

    pub async fn query(&self, text: &str, user_id: &str) -> AgentResult<AgentResponse> {
        self.answer(QueryRequest::new(text, user_id)).await
    }

    pub fn clear_user_cache(&self, user_id: &str) -> usize {
        self.cache.clear_user(user_id)
    }

    fn uses_llm(&self, request: &QueryRequest) -> bool {
        self.orchestrator.is_some() && (request.use_llm || request.streaming)
    }

    // cache lookup, dispatch, write-through
    async fn resolve(&self, request: &QueryRequest, normalized: &str, sink: &EventSink) -> AgentResult<AgentResponse> {
        let started = Instant::now();
        let key = fingerprint(normalized);

        if let Some(response) = self.cached_response(&key, &request.user_id, started) {
            info!(user_id = %request.user_id, cached = true, elapsed_ms = response.execution_time, "query answered");
            REQUEST_LATENCY.observe(started.elapsed().as_secs_f64());
            return Ok(response);
        }

        let mut response = match &self.orchestrator {
            Some(orchestrator) if self.uses_llm(request) => {
                let outcome = orchestrator.run(request.text.trim(), &request.user_id, sink).await?;
                assemble_from_outcome(outcome)
            }
            _ => self.run_selected(normalized, &request.user_id, sink).await?,
        };
        response.execution_time = elapsed_ms(started);

        match serde_json::to_value(&response) {
            Ok(value) => {
                let ttl = self.config.cache_ttl.as_secs_f64();
                self.cache
                    .set(&key, value, SetOptions::ttl(ttl).for_user(&request.user_id))
                    .await;
            }
            Err(e) => warn!(error = %e, "response not cacheable"),
        }

        info!(user_id = %request.user_id, cached = false, elapsed_ms = response.execution_time, "query answered");
        REQUEST_LATENCY.observe(started.elapsed().as_secs_f64());
        Ok(response)
    }

    fn cached_response(&self, key: &str, user_id: &str, started: Instant) -> Option<AgentResponse> {
        let value = self.cache.get(key, Some(user_id))?;
        match serde_json::from_value::<AgentResponse>(value) {
            Ok(mut response) => {
                response.cached = true;
                response.execution_time = elapsed_ms(started);
                Some(response)
            }
            Err(e) => {
                warn!(error = %e, "unreadable cache entry treated as a miss");
                None
            }
        }
    }

    async fn run_selected(&self, normalized: &str, user_id: &str, sink: &EventSink) -> AgentResult<AgentResponse> {
        let call = self.selector.route(normalized);
        sink.tool_call(&call, ToolCallStatus::Started, None).await;

        let result = match self.executor.execute(&call.name, &call.arguments, user_id).await {
            Ok(result) => result,
            Err(err) => {
                sink.tool_call(&call, ToolCallStatus::Failed, Some(err.to_string())).await;
                return Err(err);
            }
        };
        sink.tool_call(&call, ToolCallStatus::Completed, Some(format!("total: {:.2}", result.total)))
            .await;

        Ok(assemble(&call, &result, None))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn assemble(call: &FunctionCall, result: &NormalizedResult, model_message: Option<String>) -> AgentResponse {
    let (summary, insights) = summarize(call, result);
    AgentResponse {
        message: model_message.filter(|m| !m.is_empty()).unwrap_or(summary),
        data: Some(response_data(call, result)),
        insights: (!insights.is_empty()).then_some(insights),
        error: None,
        cached: false,
        execution_time: 0,
    }
}

fn assemble_from_outcome(outcome: OrchestratorOutcome) -> AgentResponse {
    let Some(last) = outcome.executions.last() else {
        // the model answered without looking anything up
        let message = if outcome.message.is_empty() {
            "I couldn't find an answer to that question.".to_string()
        } else {
            outcome.message
        };
        return AgentResponse {
            message,
            data: None,
            insights: None,
            error: None,
            cached: false,
            execution_time: 0,
        };
    };

    let mut response = assemble(&last.call, &last.result, Some(outcome.message.clone()));
    if outcome.executions.len() > 1 {
        if let Some(data) = response.data.as_mut() {
            data["steps"] = json!(outcome
                .executions
                .iter()
                .map(|e| response_data(&e.call, &e.result))
                .collect::<Vec<_>>());
        }
    }
    response
}
