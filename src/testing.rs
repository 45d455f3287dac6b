// scripted collaborators for unit tests

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use crate::analytics::{AnalyticsBackend, AnalyticsFunction};
use crate::error::{AgentError, AgentResult};
use crate::llm::{ChatDelta, ChatMessage, ChatModel, DeltaStream, ToolDefinition};

// Analytics backend that returns a fixed answer and counts calls
pub struct CountingBackend {
    response: Result<Value, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_user: Mutex<Option<String>>,
    last_function: Mutex<Option<AnalyticsFunction>>,
}

impl CountingBackend {
    pub fn returning(value: Value) -> Self {
        Self::with(Ok(value))
    }

    pub fn failing(message: &str) -> Self {
        Self::with(Err(message.to_string()))
    }

    fn with(response: Result<Value, String>) -> Self {
        Self {
            response,
            delay: None,
            calls: AtomicUsize::new(0),
            last_user: Mutex::new(None),
            last_function: Mutex::new(None),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_user(&self) -> Option<String> {
        self.last_user.lock().clone()
    }

    pub fn last_function(&self) -> Option<AnalyticsFunction> {
        *self.last_function.lock()
    }
}

#[async_trait]
impl AnalyticsBackend for CountingBackend {
    async fn call(&self, function: AnalyticsFunction, user_id: &str, _params: &Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_user.lock() = Some(user_id.to_string());
        *self.last_function.lock() = Some(function);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone().map_err(|e| anyhow::anyhow!(e))
    }
}

// Analytics backend with a bug in it
pub struct PanickingBackend;

#[async_trait]
impl AnalyticsBackend for PanickingBackend {
    async fn call(&self, _function: AnalyticsFunction, _user_id: &str, _params: &Value) -> anyhow::Result<Value> {
        panic!("analytics exploded");
    }
}

// What the scripted model does on one call
pub enum Script {
    Deltas(Vec<AgentResult<ChatDelta>>),
    Fail(AgentError),
    Hang,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// Chat model that replays one script entry per call
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Script>>,
    histories: Mutex<Vec<Vec<ChatMessage>>>,
    calls: AtomicUsize,
    hung_dropped: Arc<AtomicBool>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Script>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            histories: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            hung_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    // A turn that streams one tool call in fragments
    pub fn tool_turn(index: u32, id: &str, name: &str, fragments: &[&str]) -> Script {
        let mut deltas = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let delta = if i == 0 {
                ChatDelta::tool_call(index, Some(id), Some(name), Some(*fragment))
            } else {
                ChatDelta::tool_call(index, None, None, Some(*fragment))
            };
            deltas.push(Ok(delta));
        }
        deltas.push(Ok(ChatDelta::finish("tool_calls")));
        Script::Deltas(deltas)
    }

    pub fn text_turn(fragments: &[&str]) -> Script {
        let mut deltas: Vec<AgentResult<ChatDelta>> =
            fragments.iter().map(|f| Ok(ChatDelta::content(*f))).collect();
        deltas.push(Ok(ChatDelta::finish("stop")));
        Script::Deltas(deltas)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    // History sent on the nth call (0-based)
    pub fn history(&self, call: usize) -> Vec<ChatMessage> {
        self.histories.lock().get(call).cloned().unwrap_or_default()
    }

    pub fn hung_stream_dropped(&self) -> bool {
        self.hung_dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(&self, history: &[ChatMessage], _tools: &[ToolDefinition]) -> AgentResult<DeltaStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().push(history.to_vec());

        let script = self.turns.lock().pop_front();
        match script {
            Some(Script::Deltas(deltas)) => Ok(Box::pin(futures::stream::iter(deltas))),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Hang) => {
                let guard = DropFlag(Arc::clone(&self.hung_dropped));
                let stream = futures::stream::pending::<AgentResult<ChatDelta>>().map(move |item| {
                    let _keep = &guard;
                    item
                });
                Ok(Box::pin(stream))
            }
            None => Err(AgentError::upstream("script exhausted")),
        }
    }
}
