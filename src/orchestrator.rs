use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::error::{AgentError, AgentResult};
use crate::executor::{FunctionExecutor, NormalizedResult};
use crate::llm::{AssistantToolCall, ChatMessage, ChatModel, FunctionPayload, ToolCallDelta, ToolDefinition, tool_definitions};
use crate::analytics::AnalyticsFunction;
use crate::models::{FunctionCall, ToolCallStatus};
use crate::streaming::{EventSink, unparsed_call};

// Idle -> AwaitingModel -> (ParsingToolCall -> Executing)* -> AwaitingModel | Done

pub const DEFAULT_MAX_TURNS: usize = 5;

const SYSTEM_PROMPT: &str = "You are a financial assistant for a receipt-tracking app. \
Answer questions about the user's spending by calling the provided analytics functions. \
Call a function whenever you need numbers; never invent amounts. \
Periods use snake_case such as this_month or last_year. Amounts are in USD. \
Once you have the data, answer in one or two short sentences.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    AwaitingModel,
    ParsingToolCall,
    Executing,
    Done,
}

#[derive(Default, Debug)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

// Stitches streamed tool-call fragments together by index
#[derive(Default, Debug)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if call.id.is_none() {
            call.id = delta.id.clone();
        }
        if let Some(name) = &delta.name {
            call.name.push_str(name);
        }
        if let Some(args) = &delta.arguments {
            call.arguments.push_str(args);
        }
    }

    // Completed calls in index order
    pub fn finish(self) -> Vec<PendingToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| PendingToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name: call.name,
                arguments: call.arguments,
            })
            .collect()
    }
}

// A fully accumulated but not yet parsed tool call
#[derive(Clone, Debug, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    pub fn parse(&self) -> AgentResult<FunctionCall> {
        let function = self.name.parse::<AnalyticsFunction>()?;
        let arguments = if self.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(&self.arguments).map_err(|e| AgentError::ToolArgumentParse {
                tool: self.name.clone(),
                message: e.to_string(),
            })?
        };
        if !arguments.is_object() {
            return Err(AgentError::ToolArgumentParse {
                tool: self.name.clone(),
                message: "arguments must be a JSON object".to_string(),
            });
        }
        Ok(FunctionCall {
            name: function.name().to_string(),
            arguments,
        })
    }

    fn echo(&self) -> AssistantToolCall {
        AssistantToolCall {
            id: self.id.clone(),
            kind: "function".to_string(),
            function: FunctionPayload {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct ModelTurn {
    pub content: String,
    pub tool_calls: Vec<PendingToolCall>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolExecution {
    pub call: FunctionCall,
    pub result: NormalizedResult,
}

#[derive(Debug, Default)]
pub struct OrchestratorOutcome {
    pub message: String,
    pub executions: Vec<ToolExecution>,
    pub turns: usize,
    pub recovered_errors: Vec<String>,
}

pub struct ToolCallOrchestrator {
    model: Arc<dyn ChatModel>,
    executor: Arc<FunctionExecutor>,
    tools: Vec<ToolDefinition>,
    max_turns: usize,
}

impl ToolCallOrchestrator {
    pub fn new(model: Arc<dyn ChatModel>, executor: Arc<FunctionExecutor>, max_turns: usize) -> Self {
        Self {
            model,
            executor,
            tools: tool_definitions(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub async fn run(&self, query: &str, user_id: &str, sink: &EventSink) -> AgentResult<OrchestratorOutcome> {
        let mut history = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(query)];
        let mut outcome = OrchestratorOutcome::default();
        let mut state = OrchestratorState::Idle;

        for turn in 1..=self.max_turns {
            sink.check()?;
            transition(&mut state, OrchestratorState::AwaitingModel, turn);
            let model_turn = self.next_turn(&history, sink).await?;
            outcome.turns = turn;

            if model_turn.tool_calls.is_empty() {
                transition(&mut state, OrchestratorState::Done, turn);
                outcome.message = model_turn.content.trim().to_string();
                return Ok(outcome);
            }
            if turn == self.max_turns {
                // no turn left to read the results
                break;
            }

            history.push(ChatMessage::assistant(
                model_turn.content,
                model_turn.tool_calls.iter().map(PendingToolCall::echo).collect(),
            ));

            for pending in model_turn.tool_calls {
                transition(&mut state, OrchestratorState::ParsingToolCall, turn);
                let call = match pending.parse() {
                    Ok(call) => call,
                    Err(err) if err.is_recoverable() => {
                        warn!(tool = %pending.name, error = %err, "model produced an unusable tool call");
                        sink.tool_call(
                            &unparsed_call(&pending.name, &pending.arguments),
                            ToolCallStatus::Failed,
                            Some(err.to_string()),
                        )
                        .await;
                        history.push(ChatMessage::tool(&pending.id, json!({"error": err.to_string()}).to_string()));
                        outcome.recovered_errors.push(err.to_string());
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                sink.check()?;
                transition(&mut state, OrchestratorState::Executing, turn);
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

                let content = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
                history.push(ChatMessage::tool(&pending.id, content));
                outcome.executions.push(ToolExecution { call, result });
            }
        }

        warn!(max_turns = self.max_turns, user_id, "tool loop did not converge");
        Err(AgentError::ToolLoopExceeded {
            max_turns: self.max_turns,
        })
    }

    // Stream one model turn to completion, or until the reader goes away
    async fn next_turn(&self, history: &[ChatMessage], sink: &EventSink) -> AgentResult<ModelTurn> {
        let mut stream = tokio::select! {
            biased;
            _ = sink.cancelled() => return Err(AgentError::Cancelled),
            stream = self.model.stream_chat(history, &self.tools) => stream?,
        };

        let mut content = String::new();
        let mut calls = ToolCallAccumulator::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = sink.cancelled() => return Err(AgentError::Cancelled),
                next = stream.next() => next,
            };
            let Some(delta) = next else {
                break;
            };
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            if let Some(text) = &delta.content {
                content.push_str(text);
            }
            for fragment in &delta.tool_calls {
                calls.push(fragment);
            }
            if delta.finish_reason.is_some() {
                break;
            }
        }

        Ok(ModelTurn {
            content,
            tool_calls: calls.finish(),
        })
    }
}

fn transition(state: &mut OrchestratorState, next: OrchestratorState, turn: usize) {
    debug!(from = ?*state, to = ?next, turn, "orchestrator transition");
    *state = next;
}
