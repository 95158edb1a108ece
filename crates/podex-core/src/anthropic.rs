// Anthropic Messages API Driver
//
// Implements LlmDriver against the Anthropic messages API with SSE
// streaming. Tool input JSON arrives as incremental input_json_delta
// frames and is accumulated per content block until content_block_stop,
// at which point it is parsed; malformed JSON becomes {} and is logged.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::llm::{
    resolve_anthropic_model_id, CompletionRequest, CompletionStream, LlmDriver, LlmStreamEvent,
    TokenUsage,
};
use crate::message::{Message, MessageRole};
use crate::tools::ToolDefinition;

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API driver
///
/// Also used for the platform cloud backend by pointing `api_url` at the
/// cloud proxy endpoint.
#[derive(Clone)]
pub struct AnthropicDriver {
    client: Client,
    api_key: String,
    api_url: String,
}

impl AnthropicDriver {
    /// Create a new driver with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Create a new driver from the ANTHROPIC_API_KEY environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| CoreError::llm("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    /// Create a new driver with a custom endpoint (cloud proxy, tests)
    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
        }
    }

    /// Split conversation messages into the system prompt and the
    /// Anthropic-format message list
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system = None;
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => {
                    system = Some(msg.content.clone());
                }
                MessageRole::User => {
                    converted.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: json!(msg.content),
                    });
                }
                MessageRole::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for tc in msg.tool_calls.iter().flatten() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    converted.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: json!(blocks),
                    });
                }
                MessageRole::Tool => {
                    // Tool results travel as user-role tool_result blocks
                    converted.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: json!([{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                            "content": msg.content,
                        }]),
                    });
                }
            }
        }

        (system, converted)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl LlmDriver for AnthropicDriver {
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let (system, messages) = Self::convert_messages(&request.messages);

        let body = AnthropicRequest {
            model: resolve_anthropic_model_id(&request.model),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages,
            system,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(Self::convert_tools(&request.tools))
            },
            stream: true,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::llm(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CoreError::llm(format!(
                "Anthropic API error ({}): {}",
                status, error_text
            )));
        }

        let event_stream = response.bytes_stream().eventsource();
        let state = Arc::new(Mutex::new(StreamState::default()));

        let converted: CompletionStream = Box::pin(event_stream.filter_map(move |result| {
            let state = Arc::clone(&state);

            async move {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => return Some(Ok(LlmStreamEvent::Error(format!("Stream error: {}", e)))),
                };

                let frame: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        return Some(Ok(LlmStreamEvent::Error(format!(
                            "Failed to parse chunk: {}",
                            e
                        ))))
                    }
                };

                let mut state = state.lock().unwrap();
                match frame {
                    AnthropicStreamEvent::MessageStart { message } => {
                        state.input_tokens = message.usage.map(|u| u.input_tokens).unwrap_or(0);
                        None
                    }
                    AnthropicStreamEvent::ContentBlockStart { content_block, .. } => {
                        match content_block {
                            ContentBlockStart::ToolUse { id, name } => {
                                state.current_tool = Some(PartialToolCall {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input_json: String::new(),
                                });
                                Some(Ok(LlmStreamEvent::ToolCallStart { id, name }))
                            }
                            ContentBlockStart::Other => None,
                        }
                    }
                    AnthropicStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                        BlockDelta::TextDelta { text } => Some(Ok(LlmStreamEvent::Token(text))),
                        BlockDelta::ThinkingDelta { thinking } => {
                            Some(Ok(LlmStreamEvent::Thinking(thinking)))
                        }
                        BlockDelta::InputJsonDelta { partial_json } => {
                            if let Some(tool) = state.current_tool.as_mut() {
                                tool.input_json.push_str(&partial_json);
                            }
                            None
                        }
                        BlockDelta::Other => None,
                    },
                    AnthropicStreamEvent::ContentBlockStop { .. } => {
                        state.current_tool.take().map(|tool| {
                            let input = serde_json::from_str(&tool.input_json).unwrap_or_else(|e| {
                                warn!(
                                    tool = %tool.name,
                                    error = %e,
                                    "Malformed tool input JSON, using empty object"
                                );
                                json!({})
                            });
                            Ok(LlmStreamEvent::ToolCallEnd {
                                id: tool.id,
                                name: tool.name,
                                input,
                            })
                        })
                    }
                    AnthropicStreamEvent::MessageDelta { delta, usage } => {
                        if let Some(usage) = usage {
                            state.output_tokens = usage.output_tokens;
                        }
                        if let Some(reason) = delta.and_then(|d| d.stop_reason) {
                            state.stop_reason = Some(reason);
                        }
                        None
                    }
                    AnthropicStreamEvent::MessageStop => Some(Ok(LlmStreamEvent::Done {
                        usage: TokenUsage::new(state.input_tokens, state.output_tokens),
                        stop_reason: state.stop_reason.clone().or(Some("end_turn".to_string())),
                    })),
                    AnthropicStreamEvent::Ping => None,
                    AnthropicStreamEvent::Error { error } => {
                        Some(Ok(LlmStreamEvent::Error(error.message)))
                    }
                }
            }
        }));

        Ok(converted)
    }
}

impl std::fmt::Debug for AnthropicDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicDriver")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// In-flight tool call being accumulated
#[derive(Debug)]
struct PartialToolCall {
    id: String,
    name: String,
    input_json: String,
}

#[derive(Debug, Default)]
struct StreamState {
    current_tool: Option<PartialToolCall>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

// ============================================================================
// Anthropic API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        #[allow(dead_code)]
        index: u32,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        #[allow(dead_code)]
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        delta: Option<MessageDeltaBody>,
        usage: Option<OutputUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<InputUsage>,
}

#[derive(Debug, Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStart {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmStreamEvent;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(frames: &[&str]) -> String {
        frames
            .iter()
            .map(|f| format!("event: message\ndata: {}\n\n", f))
            .collect()
    }

    #[test]
    fn test_driver_debug_redacts_key() {
        let driver = AnthropicDriver::new("sk-ant-secret");
        let debug = format!("{:?}", driver);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-ant-secret"));
    }

    #[test]
    fn test_convert_messages_extracts_system() {
        let messages = vec![
            Message::text(MessageRole::System, "be helpful"),
            Message::text(MessageRole::User, "hi"),
        ];
        let (system, converted) = AnthropicDriver::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be helpful"));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
    }

    #[test]
    fn test_convert_tool_result_as_user_block() {
        let messages = vec![Message::tool_result("toolu_1", "ok")];
        let (_, converted) = AnthropicDriver::convert_messages(&messages);
        assert_eq!(converted[0].role, "user");
        let blocks = converted[0].content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "tool_result");
        assert_eq!(blocks[0]["tool_use_id"], "toolu_1");
    }

    #[tokio::test]
    async fn test_stream_accumulates_tool_input() {
        let server = MockServer::start().await;

        let body = sse_body(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"write_file"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"a.py\"}"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":7}}"#,
            r#"{"type":"message_stop"}"#,
        ]);

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let driver = AnthropicDriver::with_base_url(
            "test-key",
            format!("{}/v1/messages", server.uri()),
        );

        let request = CompletionRequest::new(
            "claude-sonnet-4-5",
            vec![Message::text(MessageRole::User, "write a file")],
        );
        let response = driver.complete(&request).await.unwrap();

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "write_file");
        assert_eq!(response.tool_calls[0].arguments["path"], "a.py");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 7);
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
    }

    #[tokio::test]
    async fn test_stream_malformed_tool_json_becomes_empty_object() {
        let server = MockServer::start().await;

        let body = sse_body(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"run_command"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{not json"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_stop"}"#,
        ]);

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let driver =
            AnthropicDriver::with_base_url("test-key", format!("{}/v1/messages", server.uri()));
        let request = CompletionRequest::new(
            "sonnet",
            vec![Message::text(MessageRole::User, "run something")],
        );
        let response = driver.complete(&request).await.unwrap();

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_stream_text_and_thinking() {
        let server = MockServer::start().await;

        let body = sse_body(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":3}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" world"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ]);

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let driver =
            AnthropicDriver::with_base_url("test-key", format!("{}/v1/messages", server.uri()));
        let request =
            CompletionRequest::new("sonnet", vec![Message::text(MessageRole::User, "hi")]);

        use futures::StreamExt;
        let mut stream = driver.stream(&request).await.unwrap();
        let mut saw_thinking = false;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                LlmStreamEvent::Thinking(t) => {
                    saw_thinking = true;
                    assert_eq!(t, "hmm");
                }
                LlmStreamEvent::Token(t) => text.push_str(&t),
                _ => {}
            }
        }
        assert!(saw_thinking);
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_api_error_propagates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let driver =
            AnthropicDriver::with_base_url("test-key", format!("{}/v1/messages", server.uri()));
        let request =
            CompletionRequest::new("sonnet", vec![Message::text(MessageRole::User, "hi")]);

        let err = driver.complete(&request).await.unwrap_err();
        assert!(err.to_string().contains("Anthropic API error"));
    }
}
