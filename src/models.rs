use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::{AgentError, AgentResult};

pub const MAX_QUERY_CHARS: usize = 1000;

// Body of POST /agent/query
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QueryBody {
    pub query: String,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub use_llm: bool,
}

// One question from one user, lives for a single dispatch
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub text: String,
    pub user_id: String,
    pub streaming: bool,
    pub use_llm: bool,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            streaming: false,
            use_llm: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_llm(mut self) -> Self {
        self.use_llm = true;
        self
    }

    pub fn from_body(body: QueryBody, user_id: impl Into<String>) -> Self {
        Self {
            text: body.query,
            user_id: user_id.into(),
            streaming: body.streaming,
            use_llm: body.use_llm,
        }
    }

    // Trimmed query text, or a validation error
    pub fn validate(&self) -> AgentResult<&str> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            return Err(AgentError::validation("Query cannot be empty"));
        }
        if trimmed.chars().count() > MAX_QUERY_CHARS {
            return Err(AgentError::validation(format!(
                "Query is too long (max {} characters)",
                MAX_QUERY_CHARS
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(AgentError::validation("Missing user id"));
        }
        Ok(trimmed)
    }
}

// A resolved analytics invocation, synthesized or assembled from model deltas
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub message: String,
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cached: bool,
    pub execution_time: u64,
}

impl AgentResponse {
    pub fn failure(err: &AgentError, execution_time: u64) -> Self {
        Self {
            message: err.user_message(),
            data: None,
            insights: None,
            error: Some(err.to_string()),
            cached: false,
            execution_time,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Started,
    Completed,
    Failed,
}

// One line of the newline-delimited streaming protocol
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamingEvent {
    Start {
        message: String,
    },
    ToolCall {
        name: String,
        arguments: Value,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete {
        response: AgentResponse,
    },
    Error {
        message: String,
        error: String,
    },
}

impl StreamingEvent {
    pub fn start() -> Self {
        Self::Start {
            message: "Analyzing your request...".to_string(),
        }
    }

    pub fn from_error(err: &AgentError) -> Self {
        Self::Error {
            message: err.user_message(),
            error: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    // NDJSON line including the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"type": "error", "message": "Failed to encode event", "error": e.to_string()})
                .to_string()
        });
        line.push('\n');
        line
    }
}
