// spending questions answered from receipt analytics, cached per user

pub mod analytics;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod selector;
pub mod state;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Dispatch, EngineConfig, QueryDispatchEngine};
pub use error::{AgentError, AgentResult};
