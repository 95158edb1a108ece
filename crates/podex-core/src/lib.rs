// Podex Core - runtime abstractions shared by the agent, compute, and api crates
//
// This crate holds the provider-agnostic pieces: conversation messages,
// permission modes, tool types and categories, the LlmDriver trait with
// its Anthropic and OpenAI-protocol implementations, inline tool-call
// extraction, and environment-driven settings.

pub mod anthropic;
pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod message;
pub mod mode;
pub mod openai;
pub mod tools;

pub use config::Settings;
pub use error::{CoreError, Result};
pub use llm::{
    resolve_provider, usage_source, BoxedLlmDriver, CompletionRequest, CompletionResponse,
    CompletionStream, LlmDriver, LlmStreamEvent, ProviderKind, TokenUsage, UsageRecord,
    UsageSink, UsageSource,
};
pub use message::{Message, MessageRole};
pub use mode::AgentMode;
pub use tools::{ActionType, ToolCall, ToolCategories, ToolDefinition};

use std::collections::HashMap;
use std::sync::Arc;

use crate::anthropic::AnthropicDriver;
use crate::openai::OpenAiDriver;

/// Create a driver for a provider kind using platform configuration and an
/// optional user-supplied key.
///
/// The google provider has no native backend here; gemini models are served
/// through an OpenAI-compatible endpoint when configured, so resolution maps
/// it to the OpenAI-protocol driver.
pub fn create_driver(
    provider: ProviderKind,
    user_api_key: Option<&str>,
    settings: &Settings,
) -> Result<Arc<dyn LlmDriver>> {
    match provider {
        ProviderKind::Anthropic => {
            let key = user_api_key
                .map(|k| k.to_string())
                .or_else(|| settings.anthropic_api_key.clone())
                .ok_or_else(|| CoreError::config("No Anthropic API key configured"))?;
            Ok(Arc::new(AnthropicDriver::new(key)))
        }
        ProviderKind::Cloud => {
            let key = settings
                .anthropic_api_key
                .clone()
                .ok_or_else(|| CoreError::config("No platform cloud API key configured"))?;
            Ok(Arc::new(AnthropicDriver::with_base_url(
                key,
                format!(
                    "{}/v1/messages",
                    env_cloud_url().trim_end_matches('/')
                ),
            )))
        }
        ProviderKind::OpenAi | ProviderKind::Google => {
            let key = user_api_key
                .map(|k| k.to_string())
                .or_else(|| settings.openai_api_key.clone())
                .ok_or_else(|| CoreError::config("No OpenAI API key configured"))?;
            Ok(Arc::new(OpenAiDriver::new(key)))
        }
        ProviderKind::Local => Ok(Arc::new(OpenAiDriver::local(
            settings.local_llm_url.clone(),
            settings.local_llm_model.clone(),
        ))),
    }
}

fn env_cloud_url() -> String {
    std::env::var("PODEX_CLOUD_LLM_URL")
        .unwrap_or_else(|_| "https://llm.podex.cloud".to_string())
}

/// Resolve the provider for a request and build the matching driver.
/// Returns the driver together with the usage source for accounting.
pub fn driver_for_request(
    request: &CompletionRequest,
    settings: &Settings,
) -> Result<(Arc<dyn LlmDriver>, UsageSource)> {
    let default_provider = settings
        .llm_provider
        .parse::<ProviderKind>()
        .unwrap_or(ProviderKind::Cloud);

    let resolved = resolve_provider(
        &request.model,
        request.model_provider.as_deref(),
        request.llm_api_keys.as_ref(),
        default_provider,
    );

    let source = usage_source(resolved.provider, resolved.user_api_key.is_some());
    let driver = create_driver(resolved.provider, resolved.user_api_key.as_deref(), settings)?;
    Ok((driver, source))
}

/// Convenience for tests: build a request key map from pairs
pub fn api_keys(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
