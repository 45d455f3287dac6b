use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use tracing::debug;
use crate::analytics::AnalyticsFunction;
use crate::error::{AgentError, AgentResult};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionPayload {
    pub name: String,
    pub arguments: String,
}

// Tool call as it is echoed back to the model in the history
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AssistantToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionPayload,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<AssistantToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<AssistantToolCall>) -> Self {
        let content = content.into();
        Self {
            role: Role::Assistant,
            content: (!content.is_empty()).then_some(content),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

// Declarations for the fixed analytics function set
pub fn tool_definitions() -> Vec<ToolDefinition> {
    AnalyticsFunction::ALL
        .into_iter()
        .map(|f| ToolDefinition {
            kind: "function".to_string(),
            function: ToolFunction {
                name: f.name().to_string(),
                description: f.description().to_string(),
                parameters: f.parameters(),
            },
        })
        .collect()
}

/// Fragment of one tool call. Fragments sharing an `index` belong together
/// and are concatenated in arrival order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

impl ChatDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> Self {
        Self {
            tool_calls: vec![ToolCallDelta {
                index,
                id: id.map(str::to_string),
                name: name.map(str::to_string),
                arguments: arguments.map(str::to_string),
            }],
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
    }
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = AgentResult<ChatDelta>> + Send>>;

// history and tool declarations in, streamed deltas out
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AgentResult<DeltaStream>;
}

// OpenAI-compatible /chat/completions over SSE
pub struct OpenAiChatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiChatClient {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn request_body(&self, history: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": history,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AgentResult<DeltaStream> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(%url, model = %self.model, messages = history.len(), "requesting model turn");

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(history, tools))
            .send()
            .await
            .map_err(AgentError::upstream)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AgentError::upstream(format!("{}: {}", status, body)));
        }

        Ok(sse_deltas(res.bytes_stream()))
    }
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum SseLine {
    Delta(ChatDelta),
    Done,
    Skip,
}

// One SSE line -> delta. Comments, blank lines and keep-alives are skipped.
pub fn parse_sse_line(line: &str) -> AgentResult<SseLine> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: WireChunk = serde_json::from_str(data)
        .map_err(|e| AgentError::upstream(format!("malformed stream chunk: {}", e)))?;
    if let Some(err) = chunk.error {
        return Err(AgentError::upstream(err));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseLine::Skip);
    };

    Ok(SseLine::Delta(ChatDelta {
        content: choice.delta.content,
        tool_calls: choice
            .delta
            .tool_calls
            .into_iter()
            .map(|tc| {
                let (name, arguments) = tc
                    .function
                    .map(|f| (f.name, f.arguments))
                    .unwrap_or((None, None));
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect(),
        finish_reason: choice.finish_reason,
    }))
}

struct SseState<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<AgentResult<ChatDelta>>,
    done: bool,
}

impl<S> SseState<S> {
    // Returns false once [DONE] or an error has been seen
    fn feed_line(&mut self, raw: &[u8]) -> bool {
        match parse_sse_line(&String::from_utf8_lossy(raw)) {
            Ok(SseLine::Delta(delta)) => {
                self.pending.push_back(Ok(delta));
                true
            }
            Ok(SseLine::Skip) => true,
            Ok(SseLine::Done) => false,
            Err(e) => {
                self.pending.push_back(Err(e));
                false
            }
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if !self.feed_line(&line) {
                self.done = true;
                self.buffer.clear();
                return;
            }
        }
    }
}

/// Turn an SSE byte stream into deltas, buffering lines split across
/// network chunks. The byte stream is dropped when the delta stream is.
pub fn sse_deltas<S, B, E>(byte_stream: S) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        inner: Box::pin(byte_stream),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(bytes.as_ref());
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(AgentError::upstream(format!("stream error: {}", e))), st));
                }
                None => {
                    st.done = true;
                    let rest = std::mem::take(&mut st.buffer);
                    if !rest.is_empty() {
                        st.feed_line(&rest);
                    }
                }
            }
        }
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &str) -> Result<Vec<u8>, String> {
        Ok(data.as_bytes().to_vec())
    }

    #[test]
    fn parses_content_and_tool_call_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Delta(ChatDelta::content("Hi")));

        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_1","function":{"name":"getTopMerchants","arguments":"{\"li"}}]}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            SseLine::Delta(ChatDelta::tool_call(1, Some("call_1"), Some("getTopMerchants"), Some("{\"li")))
        );

        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert!(parse_sse_line("data: {not json").is_err());
        assert!(parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#).is_err());
    }

    #[tokio::test]
    async fn reassembles_lines_split_across_chunks() {
        let bytes = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"con"),
            chunk("tent\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n"),
            chunk("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n"),
            chunk("data: [DONE]\n\n"),
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n"),
        ];
        let deltas: Vec<_> = sse_deltas(futures::stream::iter(bytes)).collect().await;
        let deltas: Vec<ChatDelta> = deltas.into_iter().map(Result::unwrap).collect();

        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].content.as_deref(), Some("Hel"));
        assert_eq!(deltas[1].content.as_deref(), Some("lo"));
        assert_eq!(deltas[2].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn transport_error_ends_the_stream() {
        let bytes = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"),
            Err("connection reset".to_string()),
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n"),
        ];
        let items: Vec<_> = sse_deltas(futures::stream::iter(bytes)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(AgentError::UpstreamModel { .. })));
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_kept() {
        let bytes = vec![chunk("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}")];
        let items: Vec<_> = sse_deltas(futures::stream::iter(bytes)).collect().await;
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn request_declares_tools_and_streaming() {
        let client = OpenAiChatClient::new(reqwest::Client::new(), "http://llm/v1/", "m", "k");
        let body = client.request_body(&[ChatMessage::user("hi")], &tool_definitions());
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["tools"].as_array().unwrap().len(), 4);
        assert_eq!(body["tools"][0]["function"]["name"], json!("getSpendingByVendor"));
        assert_eq!(body["messages"][0]["role"], json!("user"));

        let body = client.request_body(&[], &[]);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tool_messages_serialize_in_openai_shape() {
        let msg = ChatMessage::tool("call_1", "{\"total\":1}");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], json!("tool"));
        assert_eq!(value["tool_call_id"], json!("call_1"));
        assert!(value.get("tool_calls").is_none());

        let msg = ChatMessage::assistant("", vec![]);
        assert_eq!(serde_json::to_value(&msg).unwrap()["content"], Value::Null);
    }

    #[test]
    fn empty_delta_detection() {
        assert!(ChatDelta::default().is_empty());
        assert!(ChatDelta::content("").is_empty());
        assert!(!ChatDelta::finish("stop").is_empty());
        assert!(!ChatDelta::tool_call(0, None, None, Some("{")).is_empty());
    }
}
