use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use crate::error::{AgentError, AgentResult};
use crate::models::{AgentResponse, FunctionCall, StreamingEvent, ToolCallStatus};

// one start, tool progress, then exactly one complete or error while someone reads
pub type EventStream = ReceiverStream<StreamingEvent>;

// Progress side of a stream, handed to the pipeline
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamingEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    // For non-streaming calls: progress goes nowhere and nothing cancels
    pub fn detached() -> Self {
        Self {
            tx: None,
            cancel: CancellationToken::new(),
        }
    }

    fn attached(tx: mpsc::Sender<StreamingEvent>, cancel: CancellationToken) -> Self {
        Self {
            tx: Some(tx),
            cancel,
        }
    }

    pub async fn tool_call(&self, call: &FunctionCall, status: ToolCallStatus, detail: Option<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = StreamingEvent::ToolCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            status,
            detail,
        };
        if tx.send(event).await.is_err() {
            // reader is gone
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check(&self) -> AgentResult<()> {
        if self.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Clone, Debug)]
pub struct StreamingResponder {
    buffer: usize,
}

impl Default for StreamingResponder {
    fn default() -> Self {
        Self { buffer: 32 }
    }
}

impl StreamingResponder {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Run `work` on its own task and return the event stream it feeds.
    ///
    /// Dropping the returned stream cancels the work: the task stops at its
    /// next suspension point and drops whatever model stream it holds.
    pub fn respond<F, Fut>(&self, work: F) -> EventStream
    where
        F: FnOnce(EventSink) -> Fut + Send + 'static,
        Fut: Future<Output = AgentResult<AgentResponse>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(drive(tx, work));
        ReceiverStream::new(rx)
    }
}

async fn drive<F, Fut>(tx: mpsc::Sender<StreamingEvent>, work: F)
where
    F: FnOnce(EventSink) -> Fut + Send + 'static,
    Fut: Future<Output = AgentResult<AgentResponse>> + Send + 'static,
{
    if tx.send(StreamingEvent::start()).await.is_err() {
        return;
    }

    let cancel = CancellationToken::new();
    let sink = EventSink::attached(tx.clone(), cancel.clone());
    let run = AssertUnwindSafe(async move { work(sink).await }).catch_unwind();

    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = tx.closed() => {
            cancel.cancel();
            debug!("stream consumer disconnected, dispatch abandoned");
            return;
        }
        _ = cancel.cancelled() => {
            debug!("stream cancelled, dispatch abandoned");
            return;
        }
    };

    let terminal = match outcome {
        Ok(Ok(response)) => StreamingEvent::Complete { response },
        Ok(Err(err)) => {
            if !matches!(err, AgentError::Cancelled) {
                error!(error = %err, "streamed dispatch failed");
            }
            StreamingEvent::from_error(&err)
        }
        Err(panic) => {
            let description = panic_message(panic);
            error!(panic = %description, "streamed dispatch panicked");
            StreamingEvent::Error {
                message: PANIC_REPLY.to_string(),
                error: description,
            }
        }
    };
    let _ = tx.send(terminal).await;
}

pub(crate) const PANIC_REPLY: &str = "Something went wrong while answering your question.";

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// Non-streaming counterpart of the panic error event
pub(crate) fn panic_response(panic: Box<dyn Any + Send>, execution_time: u64) -> AgentResponse {
    let description = panic_message(panic);
    error!(panic = %description, "dispatch panicked");
    AgentResponse {
        message: PANIC_REPLY.to_string(),
        data: None,
        insights: None,
        error: Some(description),
        cached: false,
        execution_time,
    }
}

// Shorthand used by the pipeline to report a call that failed before running
pub fn unparsed_call(name: &str, raw_arguments: &str) -> FunctionCall {
    FunctionCall {
        name: name.to_string(),
        arguments: Value::String(raw_arguments.to_string()),
    }
}
