use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

// Everything that can go wrong while answering a query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Invalid query: {0}")]
    Validation(String),

    #[error("Malformed arguments for tool {tool}: {message}")]
    ToolArgumentParse { tool: String, message: String },

    #[error("Model asked for unknown tool: {name}")]
    UnknownFunction { name: String },

    #[error("Tool loop exceeded {max_turns} turns")]
    ToolLoopExceeded { max_turns: usize },

    #[error("{function} failed: {message}")]
    Execution { function: String, message: String },

    #[error("Model request failed: {message}")]
    UpstreamModel { message: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(message: impl std::fmt::Display) -> Self {
        Self::UpstreamModel {
            message: message.to_string(),
        }
    }

    /// Errors the tool loop reports and keeps going after.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ToolArgumentParse { .. } | Self::UnknownFunction { .. }
        )
    }

    /// Text a UI can show next to the error
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::ToolArgumentParse { .. } | Self::UnknownFunction { .. } => {
                "I had trouble understanding how to look that up. Please try rephrasing your question."
                    .to_string()
            }
            Self::ToolLoopExceeded { .. } => {
                "That question needed too many steps to answer. Try asking something more specific."
                    .to_string()
            }
            Self::Execution { .. } => {
                "Sorry, I couldn't retrieve your spending data right now.".to_string()
            }
            Self::UpstreamModel { .. } => {
                "The assistant is temporarily unavailable. Please try again shortly.".to_string()
            }
            Self::Cancelled => "Request cancelled.".to_string(),
        }
    }
}
