// LLM Driver Abstractions
//
// This module encapsulates everything needed to talk to LLM providers:
// - LlmDriver trait and stream/response types
// - Provider resolution (hint > model-id inference > user key > default)
// - Anthropic model alias mapping
// - Usage accounting via the UsageSink trait
//
// IMPORTANT: the drivers never retry internally; retry policy belongs to
// the orchestrator.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::message::Message;
use crate::tools::{ToolCall, ToolDefinition};

// ============================================================================
// Request / Response Types
// ============================================================================

/// Request parameters for an LLM completion
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub agent_id: Option<String>,
    /// User-provided API keys per provider, e.g. {"anthropic": "sk-ant-..."}
    pub llm_api_keys: Option<HashMap<String, String>>,
    /// Provider registered for the model in the model registry; takes
    /// precedence over inferring the provider from the model id
    pub model_provider: Option<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.7,
            user_id: None,
            session_id: None,
            workspace_id: None,
            agent_id: None,
            llm_api_keys: None,
            model_provider: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Response from a non-streaming completion
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

/// Type alias for the LLM response stream
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<LlmStreamEvent>> + Send>>;

/// Events emitted during streaming completion
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    /// Text delta (incremental content)
    Token(String),
    /// Reasoning delta, where the backend supports it
    Thinking(String),
    /// A tool call started streaming
    ToolCallStart { id: String, name: String },
    /// A tool call finished; input is the final parsed arguments object
    ToolCallEnd {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Streaming completed
    Done {
        usage: TokenUsage,
        stop_reason: Option<String>,
    },
    /// Error during streaming
    Error(String),
}

// ============================================================================
// LlmDriver Trait
// ============================================================================

/// Trait for LLM backends
///
/// Implementations handle provider-specific API calls and response parsing.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Call the LLM with a streaming response
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;

    /// Call the LLM without streaming (convenience method)
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        use futures::StreamExt;

        let mut stream = self.stream(request).await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = TokenUsage::default();
        let mut stop_reason = None;

        while let Some(event) = stream.next().await {
            match event? {
                LlmStreamEvent::Token(delta) => content.push_str(&delta),
                LlmStreamEvent::Thinking(_) => {}
                LlmStreamEvent::ToolCallStart { .. } => {}
                LlmStreamEvent::ToolCallEnd { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                LlmStreamEvent::Done {
                    usage: u,
                    stop_reason: reason,
                } => {
                    usage = u;
                    stop_reason = reason;
                }
                LlmStreamEvent::Error(err) => return Err(CoreError::llm(err)),
            }
        }

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage,
            stop_reason,
        })
    }
}

/// Boxed LLM driver for dynamic dispatch
pub type BoxedLlmDriver = Box<dyn LlmDriver>;

#[async_trait]
impl LlmDriver for Box<dyn LlmDriver> {
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        (**self).stream(request).await
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        (**self).complete(request).await
    }
}

// ============================================================================
// Provider Resolution
// ============================================================================

/// Known provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
    /// Platform-hosted Anthropic-via-cloud backend
    Cloud,
    /// Local OpenAI-compatible inference server
    Local,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Cloud => "cloud",
            ProviderKind::Local => "local",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "google" => Ok(ProviderKind::Google),
            "cloud" => Ok(ProviderKind::Cloud),
            "local" => Ok(ProviderKind::Local),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the tokens were billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    /// Platform cloud backend; the only source that counts against quota
    Included,
    /// User API key or direct vendor key
    External,
    /// Local inference server; free
    Local,
}

/// Determine the native provider for a model id, if recognizable
///
/// `claude*` and the short aliases map to anthropic; `gpt-`/`o1-`/`o3-`/
/// `chatgpt-` prefixes map to openai; `gemini` maps to google.
pub fn provider_for_model(model: &str) -> Option<ProviderKind> {
    let model = model.to_lowercase();

    if model.starts_with("claude") || matches!(model.as_str(), "opus" | "sonnet" | "haiku") {
        return Some(ProviderKind::Anthropic);
    }
    if ["gpt-", "o1-", "o3-", "chatgpt-"]
        .iter()
        .any(|p| model.starts_with(p))
    {
        return Some(ProviderKind::OpenAi);
    }
    if model.starts_with("gemini") {
        return Some(ProviderKind::Google);
    }
    None
}

/// Map short Anthropic aliases to canonical API model ids.
/// Unknown strings pass through unchanged.
pub fn resolve_anthropic_model_id(model: &str) -> String {
    match model.to_lowercase().as_str() {
        "opus" => "claude-opus-4-5".to_string(),
        "sonnet" => "claude-sonnet-4-5".to_string(),
        "haiku" => "claude-haiku-4-5".to_string(),
        _ => model.to_string(),
    }
}

/// Outcome of provider resolution for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub provider: ProviderKind,
    /// User key to use, when the user supplied one for this provider
    pub user_api_key: Option<String>,
}

/// Resolve which provider serves a request.
///
/// Order: the model's registered provider hint, else inference from the
/// model id. If the user supplied a key for that provider, use it;
/// otherwise fall back to the platform default provider.
pub fn resolve_provider(
    model: &str,
    model_provider: Option<&str>,
    llm_api_keys: Option<&HashMap<String, String>>,
    default_provider: ProviderKind,
) -> ResolvedProvider {
    let native = model_provider
        .and_then(|p| p.parse::<ProviderKind>().ok())
        .or_else(|| provider_for_model(model));

    if let (Some(provider), Some(keys)) = (native, llm_api_keys) {
        if let Some(key) = keys.get(provider.as_str()) {
            info!(
                model = %model,
                provider = %provider,
                "Using user-provided API key for model"
            );
            return ResolvedProvider {
                provider,
                user_api_key: Some(key.clone()),
            };
        }
    }

    debug!(
        model = %model,
        native = native.map(|p| p.as_str()).unwrap_or("unknown"),
        default = %default_provider,
        "Using default provider for model"
    );
    ResolvedProvider {
        provider: default_provider,
        user_api_key: None,
    }
}

/// Determine the usage source for billing purposes
pub fn usage_source(provider: ProviderKind, used_user_key: bool) -> UsageSource {
    match provider {
        ProviderKind::Local => UsageSource::Local,
        ProviderKind::Cloud if !used_user_key => UsageSource::Included,
        _ => UsageSource::External,
    }
}

// ============================================================================
// Usage Accounting
// ============================================================================

/// One usage record published after a completion carrying a user id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub model: String,
    pub usage: TokenUsage,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub agent_id: Option<String>,
    pub usage_source: UsageSource,
}

/// Sink for usage records. Recording is best effort and must never fail
/// the completion that produced the record.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;
}

/// No-op sink for tests and deployments without usage tracking
pub struct NullUsageSink;

#[async_trait]
impl UsageSink for NullUsageSink {
    async fn record(&self, _record: UsageRecord) -> Result<()> {
        Ok(())
    }
}

/// Rough token estimate for backends that return no usage stats
/// (1 token per 4 characters, minimum 1)
pub fn estimate_tokens(text: &str) -> u32 {
    std::cmp::max(1, (text.len() / 4) as u32)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_for_model_prefixes() {
        assert_eq!(
            provider_for_model("claude-sonnet-4-5"),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(provider_for_model("opus"), Some(ProviderKind::Anthropic));
        assert_eq!(provider_for_model("gpt-4o"), Some(ProviderKind::OpenAi));
        assert_eq!(provider_for_model("o1-preview"), Some(ProviderKind::OpenAi));
        assert_eq!(provider_for_model("o3-mini"), Some(ProviderKind::OpenAi));
        assert_eq!(
            provider_for_model("chatgpt-4o-latest"),
            Some(ProviderKind::OpenAi)
        );
        assert_eq!(
            provider_for_model("gemini-1.5-pro"),
            Some(ProviderKind::Google)
        );
        assert_eq!(provider_for_model("llama-3.1"), None);
    }

    #[test]
    fn test_anthropic_alias_mapping() {
        assert_eq!(resolve_anthropic_model_id("opus"), "claude-opus-4-5");
        assert_eq!(resolve_anthropic_model_id("Sonnet"), "claude-sonnet-4-5");
        assert_eq!(resolve_anthropic_model_id("haiku"), "claude-haiku-4-5");
        // Unknown ids pass through
        assert_eq!(
            resolve_anthropic_model_id("claude-sonnet-4-5-20250929"),
            "claude-sonnet-4-5-20250929"
        );
    }

    #[test]
    fn test_resolve_provider_hint_wins() {
        let resolved = resolve_provider("weird-model", Some("anthropic"), None, ProviderKind::Cloud);
        // No user key for anthropic, so we fall to the default
        assert_eq!(resolved.provider, ProviderKind::Cloud);
        assert!(resolved.user_api_key.is_none());
    }

    #[test]
    fn test_resolve_provider_user_key() {
        let mut keys = HashMap::new();
        keys.insert("anthropic".to_string(), "sk-ant-test".to_string());

        let resolved = resolve_provider("claude-sonnet-4-5", None, Some(&keys), ProviderKind::Cloud);
        assert_eq!(resolved.provider, ProviderKind::Anthropic);
        assert_eq!(resolved.user_api_key.as_deref(), Some("sk-ant-test"));
    }

    #[test]
    fn test_resolve_provider_hint_with_user_key() {
        let mut keys = HashMap::new();
        keys.insert("openai".to_string(), "sk-test".to_string());

        // Hint takes precedence over model-id inference
        let resolved = resolve_provider("claude-ish", Some("openai"), Some(&keys), ProviderKind::Cloud);
        assert_eq!(resolved.provider, ProviderKind::OpenAi);
        assert_eq!(resolved.user_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_usage_source_rules() {
        assert_eq!(usage_source(ProviderKind::Local, false), UsageSource::Local);
        assert_eq!(
            usage_source(ProviderKind::Cloud, false),
            UsageSource::Included
        );
        assert_eq!(
            usage_source(ProviderKind::Anthropic, true),
            UsageSource::External
        );
        assert_eq!(
            usage_source(ProviderKind::OpenAi, false),
            UsageSource::External
        );
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_token_usage_totals() {
        let usage = TokenUsage::new(100, 50);
        assert_eq!(usage.total_tokens, 150);
    }
}
