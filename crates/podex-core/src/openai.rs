// OpenAI Protocol LLM Driver
//
// Implements LlmDriver for OpenAI-compatible APIs, including local
// inference servers that speak the same protocol. Streaming tool-call
// deltas are accumulated per index; argument JSON is parsed at the end,
// malformed JSON becomes {} and is logged.

use std::collections::BTreeMap;
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
    estimate_tokens, CompletionRequest, CompletionStream, LlmDriver, LlmStreamEvent, TokenUsage,
};
use crate::message::{Message, MessageRole};
use crate::tools::ToolDefinition;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI protocol driver
///
/// `fixed_model` pins every request to one configured model - used for
/// local inference servers whose model names differ from the registry.
#[derive(Clone)]
pub struct OpenAiDriver {
    client: Client,
    api_key: String,
    api_url: String,
    fixed_model: Option<String>,
    /// Estimate usage from text when the server reports none (local servers)
    estimate_usage: bool,
}

impl OpenAiDriver {
    /// Create a new driver with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            fixed_model: None,
            estimate_usage: false,
        }
    }

    /// Create a new driver from the OPENAI_API_KEY environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| CoreError::llm("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    /// Create a new driver with a custom API URL (OpenAI-compatible APIs)
    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
            fixed_model: None,
            estimate_usage: false,
        }
    }

    /// Create a driver for a local OpenAI-compatible inference server.
    /// The request model is ignored in favor of the configured one and
    /// missing usage stats are estimated from text length.
    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base = base_url.into();
        Self {
            client: Client::new(),
            // Local servers do not check the key
            api_key: "local".to_string(),
            api_url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            fixed_model: Some(model.into()),
            estimate_usage: true,
        }
    }

    fn convert_role(role: MessageRole) -> &'static str {
        match role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    fn convert_message(msg: &Message) -> OpenAiMessage {
        OpenAiMessage {
            role: Self::convert_role(msg.role).to_string(),
            content: Some(msg.content.clone()),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| OpenAiToolCall {
                        id: tc.id.clone(),
                        r#type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: tc.name.clone(),
                            arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<OpenAiTool> {
        tools
            .iter()
            .map(|tool| OpenAiTool {
                r#type: "function".to_string(),
                function: OpenAiFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let messages: Vec<OpenAiMessage> =
            request.messages.iter().map(Self::convert_message).collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(Self::convert_tools(&request.tools))
        };

        let body = OpenAiRequest {
            model: self
                .fixed_model
                .clone()
                .unwrap_or_else(|| request.model.clone()),
            messages,
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
        };

        let estimated_input: u32 = if self.estimate_usage {
            request
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum()
        } else {
            0
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::llm(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CoreError::llm(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        let event_stream = response.bytes_stream().eventsource();
        let state = Arc::new(Mutex::new(StreamState::default()));
        let estimate_usage = self.estimate_usage;

        let converted: CompletionStream = Box::pin(
            event_stream
                .map(move |result| {
                    let state = Arc::clone(&state);

                    let events: Vec<Result<LlmStreamEvent>> = match result {
                        Ok(event) => {
                            if event.data == "[DONE]" {
                                let mut state = state.lock().unwrap();
                                state.finish(estimate_usage, estimated_input)
                            } else {
                                match serde_json::from_str::<OpenAiStreamChunk>(&event.data) {
                                    Ok(chunk) => state.lock().unwrap().apply(chunk),
                                    Err(e) => vec![Ok(LlmStreamEvent::Error(format!(
                                        "Failed to parse chunk: {}",
                                        e
                                    )))],
                                }
                            }
                        }
                        Err(e) => vec![Ok(LlmStreamEvent::Error(format!("Stream error: {}", e)))],
                    };

                    futures::stream::iter(events)
                })
                .flatten(),
        );

        Ok(converted)
    }
}

impl std::fmt::Debug for OpenAiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiDriver")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("fixed_model", &self.fixed_model)
            .finish()
    }
}

/// Tool call accumulated across stream chunks, keyed by index
#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct StreamState {
    tool_calls: BTreeMap<u32, PartialToolCall>,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    output_chars: usize,
    done: bool,
}

impl StreamState {
    /// Convert one parsed chunk into zero or more stream events
    fn apply(&mut self, chunk: OpenAiStreamChunk) -> Vec<Result<LlmStreamEvent>> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.output_chars += content.len();
                events.push(Ok(LlmStreamEvent::Token(content)));
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let entry = self.tool_calls.entry(tc.index).or_default();
            if let Some(id) = tc.id {
                entry.id = id;
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    entry.name = name;
                    events.push(Ok(LlmStreamEvent::ToolCallStart {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                    }));
                }
                if let Some(args) = function.arguments {
                    entry.arguments.push_str(&args);
                }
            }
        }

        events
    }

    /// Emit accumulated tool calls and the final Done event
    fn finish(&mut self, estimate: bool, estimated_input: u32) -> Vec<Result<LlmStreamEvent>> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut events = Vec::new();

        for tool in std::mem::take(&mut self.tool_calls).into_values() {
            let input: Value = if tool.arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tool.arguments).unwrap_or_else(|e| {
                    warn!(
                        tool = %tool.name,
                        error = %e,
                        "Malformed tool arguments JSON, using empty object"
                    );
                    json!({})
                })
            };
            events.push(Ok(LlmStreamEvent::ToolCallEnd {
                id: tool.id,
                name: tool.name,
                input,
            }));
        }

        let usage = self.usage.unwrap_or_else(|| {
            if estimate {
                let output = estimate_tokens(&"x".repeat(self.output_chars));
                TokenUsage::new(estimated_input, output)
            } else {
                TokenUsage::default()
            }
        });

        events.push(Ok(LlmStreamEvent::Done {
            usage,
            stop_reason: self.finish_reason.clone().or(Some("stop".to_string())),
        }));

        events
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
