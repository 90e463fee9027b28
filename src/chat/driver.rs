//! Model driver abstraction and the OpenAI-compatible streaming driver
//!
//! The chat engine is provider-agnostic: it consumes a [`ModelDriver`],
//! which turns a request (messages + tools + system prompt) into a lazy,
//! finite sequence of [`DriverEvent`]s delivered over a bounded channel. A
//! reader task parses the provider's SSE stream and writes events until the
//! stream ends.
//!
//! [`OpenAiCompatDriver`] speaks the `chat/completions` streaming dialect
//! shared by OpenAI, Ollama's `/v1` endpoint, and most hosted gateways.
//! Provider credentials are passed per-request from the HTTP edge and are
//! never stored beyond the driver instance built for that turn.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{McpLensError, Result};

/// A chat message in provider-neutral form.
///
/// Roles follow the OpenAI convention: `system`, `user`, `assistant`, and
/// `tool` for tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: String,
    /// Text content, absent for pure tool-call messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls issued by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For `tool` messages, the id of the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A `system` message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// A `user` message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// An `assistant` message carrying text and/or tool calls.
    pub fn assistant(content: Option<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    /// A `tool` result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Function call details within a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Namespaced tool name (`server:tool`).
    pub name: String,
    /// Arguments as a JSON string, as providers emit them.
    pub arguments: String,
}

/// A finalized model-issued tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed in the tool result.
    pub id: String,
    /// The function being invoked.
    pub function: FunctionCall,
}

/// A tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Namespaced tool name (`server:tool`).
    pub name: String,
    /// Description shown to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the arguments.
    pub parameters: serde_json::Value,
}

/// One model invocation: everything the driver needs for a single step.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    /// Model identifier (e.g. `gpt-4o-mini`).
    pub model: String,
    /// Optional system prompt prepended to the history.
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Conversation history.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may invoke.
    pub tools: Vec<ToolSpec>,
}

/// One event of a streaming model response.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A fragment of assistant text.
    TextDelta(String),
    /// A fully accumulated tool call.
    ToolCall(ToolCall),
    /// The turn-step is complete; no further events follow.
    Finished,
}

/// Capacity of the event channel between the parser task and the engine.
const DRIVER_CHANNEL_CAPACITY: usize = 64;

/// A streaming LLM backend.
///
/// `stream` returns the receiving half of a bounded channel; a background
/// task owns the network stream and pushes events until the provider
/// signals end-of-turn (a final [`DriverEvent::Finished`]) or errors.
#[async_trait]
pub trait ModelDriver: Send + Sync {
    /// Start one streaming completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued; mid-stream errors
    /// arrive as `Err` items on the channel.
    async fn stream(&self, request: DriverRequest) -> Result<mpsc::Receiver<Result<DriverEvent>>>;
}

/// Build a driver for a provider named in a chat request.
///
/// - `openai` -- `https://api.openai.com/v1`; the key comes from the request
///   or, failing that, the `OPENAI_API_KEY` environment variable.
/// - `ollama` -- `http://localhost:11434/v1`, no key.
/// - `openai-compatible` -- any gateway speaking the same dialect; requires
///   `base_url`.
///
/// # Errors
///
/// Returns [`McpLensError::Validation`] for unknown providers or missing
/// credentials.
pub fn driver_for(
    provider: &str,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> Result<std::sync::Arc<dyn ModelDriver>> {
    match provider {
        "openai" => {
            let key = api_key
                .map(str::to_string)
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| {
                    McpLensError::Validation(
                        "provider `openai` requires an apiKey (or OPENAI_API_KEY)".into(),
                    )
                })?;
            Ok(std::sync::Arc::new(OpenAiCompatDriver::new(
                base_url.unwrap_or("https://api.openai.com/v1").to_string(),
                Some(key),
            )?))
        }
        "ollama" => Ok(std::sync::Arc::new(OpenAiCompatDriver::new(
            base_url.unwrap_or("http://localhost:11434/v1").to_string(),
            None,
        )?)),
        "openai-compatible" => {
            let base = base_url.ok_or_else(|| {
                McpLensError::Validation(
                    "provider `openai-compatible` requires a baseUrl".into(),
                )
            })?;
            Ok(std::sync::Arc::new(OpenAiCompatDriver::new(
                base.to_string(),
                api_key.map(str::to_string),
            )?))
        }
        other => {
            Err(McpLensError::Validation(format!("unknown provider `{other}`")).into())
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible streaming driver
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    r#type: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    parameters: &'a serde_json::Value,
}

/// Driver for endpoints speaking the `chat/completions` streaming dialect.
pub struct OpenAiCompatDriver {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatDriver {
    /// Create a driver against `base_url` (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Driver`] if the HTTP client cannot be built.
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent(concat!("mcplens/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| McpLensError::Driver(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request_body(&self, request: &DriverRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for m in &request.messages {
            messages.push(serde_json::to_value(m).unwrap_or(serde_json::Value::Null));
        }

        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::to_value(WireTool {
                    r#type: "function",
                    function: WireFunction {
                        name: &t.name,
                        description: t.description.as_deref(),
                        parameters: &t.parameters,
                    },
                })
                .unwrap_or(serde_json::Value::Null)
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools);
        }
        body
    }
}

#[async_trait]
impl ModelDriver for OpenAiCompatDriver {
    async fn stream(&self, request: DriverRequest) -> Result<mpsc::Receiver<Result<DriverEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&self.request_body(&request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpLensError::Driver(format!("completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpLensError::Driver(format!(
                "completion request returned {status}: {body}"
            ))
            .into());
        }

        let (tx, rx) = mpsc::channel(DRIVER_CHANNEL_CAPACITY);
        let byte_stream = response.bytes_stream();
        tokio::spawn(async move {
            parse_completion_stream(byte_stream, tx).await;
        });
        Ok(rx)
    }
}

/// Accumulates streamed tool-call fragments keyed by their chunk index.
#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Parse a `chat/completions` SSE body, emitting driver events.
///
/// Text deltas are forwarded as they arrive. Tool-call fragments are
/// accumulated per index and emitted as finalized [`DriverEvent::ToolCall`]s
/// when the provider reports `finish_reason: "tool_calls"` (or at stream
/// end). The final event is always `Finished`.
async fn parse_completion_stream(
    byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>>,
    tx: mpsc::Sender<Result<DriverEvent>>,
) {
    use futures::StreamExt;

    let mut buffer = String::new();
    let mut partial: BTreeMap<u64, PartialCall> = BTreeMap::new();
    let mut calls_flushed = false;

    tokio::pin!(byte_stream);

    'outer: while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(Err(
                        McpLensError::Driver(format!("stream interrupted: {e}")).into()
                    ))
                    .await;
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer = buffer[pos + 1..].to_string();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break 'outer;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                let _ = tx
                    .send(Err(McpLensError::Driver(format!(
                        "undecodable stream chunk: {data}"
                    ))
                    .into()))
                    .await;
                return;
            };

            let choice = &value["choices"][0];
            let delta = &choice["delta"];

            if let Some(content) = delta["content"].as_str() {
                if !content.is_empty()
                    && tx
                        .send(Ok(DriverEvent::TextDelta(content.to_string())))
                        .await
                        .is_err()
                {
                    return;
                }
            }

            if let Some(fragments) = delta["tool_calls"].as_array() {
                for fragment in fragments {
                    let index = fragment["index"].as_u64().unwrap_or(0);
                    let entry = partial.entry(index).or_default();
                    if let Some(id) = fragment["id"].as_str() {
                        entry.id.push_str(id);
                    }
                    if let Some(name) = fragment["function"]["name"].as_str() {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = fragment["function"]["arguments"].as_str() {
                        entry.arguments.push_str(args);
                    }
                }
            }

            if choice["finish_reason"].as_str() == Some("tool_calls") {
                if flush_calls(&mut partial, &tx).await.is_err() {
                    return;
                }
                calls_flushed = true;
            }
        }
    }

    if !calls_flushed && flush_calls(&mut partial, &tx).await.is_err() {
        return;
    }
    let _ = tx.send(Ok(DriverEvent::Finished)).await;
}

async fn flush_calls(
    partial: &mut BTreeMap<u64, PartialCall>,
    tx: &mpsc::Sender<Result<DriverEvent>>,
) -> std::result::Result<(), ()> {
    for (_, call) in std::mem::take(partial) {
        if call.name.is_empty() {
            continue;
        }
        let event = DriverEvent::ToolCall(ToolCall {
            id: if call.id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                call.id
            },
            function: FunctionCall {
                name: call.name,
                arguments: if call.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                },
            },
        });
        if tx.send(Ok(event)).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(lines: &[&str]) -> Vec<reqwest::Result<bytes::Bytes>> {
        lines
            .iter()
            .map(|l| Ok(bytes::Bytes::from(format!("{l}\n\n"))))
            .collect()
    }

    async fn collect(chunks: Vec<reqwest::Result<bytes::Bytes>>) -> Vec<Result<DriverEvent>> {
        let (tx, mut rx) = mpsc::channel(64);
        parse_completion_stream(futures::stream::iter(chunks), tx).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_text_deltas_forwarded_then_finished() {
        let events = collect(sse(&[
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            DriverEvent::TextDelta(t) if t == "Hel"
        ));
        assert!(matches!(
            events[1].as_ref().unwrap(),
            DriverEvent::TextDelta(t) if t == "lo"
        ));
        assert!(matches!(events[2].as_ref().unwrap(), DriverEvent::Finished));
    }

    #[tokio::test]
    async fn test_tool_call_fragments_accumulated() {
        let events = collect(sse(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"srv1:echo","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"text\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"hi\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(events.len(), 2);
        match events[0].as_ref().unwrap() {
            DriverEvent::ToolCall(call) => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.function.name, "srv1:echo");
                assert_eq!(call.function.arguments, r#"{"text":"hi"}"#);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events[1].as_ref().unwrap(), DriverEvent::Finished));
    }

    #[tokio::test]
    async fn test_two_parallel_tool_calls_by_index() {
        let events = collect(sse(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"s:one","arguments":"{}"}},{"index":1,"id":"b","function":{"name":"s:two","arguments":"{}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]))
        .await;

        let names: Vec<String> = events
            .iter()
            .filter_map(|e| match e.as_ref().unwrap() {
                DriverEvent::ToolCall(c) => Some(c.function.name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["s:one", "s:two"]);
    }

    #[tokio::test]
    async fn test_undecodable_chunk_surfaces_error() {
        let events = collect(sse(&["data: {not json"])).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[test]
    fn test_driver_for_unknown_provider_rejected() {
        let result = driver_for("martian-llm", None, None);
        match result {
            Err(e) => assert!(e.to_string().contains("unknown provider")),
            Ok(_) => panic!("expected an error for unknown provider"),
        }
    }

    #[test]
    fn test_driver_for_openai_requires_key() {
        // Only meaningful when the ambient fallback is absent.
        if std::env::var("OPENAI_API_KEY").is_err() {
            assert!(driver_for("openai", None, None).is_err());
        }
        assert!(driver_for("openai", Some("sk-test"), None).is_ok());
        assert!(driver_for("ollama", None, None).is_ok());
        assert!(driver_for("openai-compatible", None, None).is_err());
        assert!(driver_for("openai-compatible", None, Some("http://localhost:8080/v1")).is_ok());
    }

    #[test]
    fn test_request_body_shape() {
        let driver = OpenAiCompatDriver::new("https://api.openai.com/v1".into(), None).unwrap();
        let body = driver.request_body(&DriverRequest {
            model: "gpt-4o-mini".into(),
            system_prompt: Some("be brief".into()),
            temperature: Some(0.2),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![ToolSpec {
                name: "srv1:echo".into(),
                description: Some("Echoes input".into()),
                parameters: serde_json::json!({"type": "object"}),
            }],
        });

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "srv1:echo");
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }
}
