pub mod base;
pub mod openai;
pub mod sse;

use crate::config::Credentials;
use crate::errors::SwarmError;
use base::LlmClient;
use std::sync::Arc;

pub const DEFAULT_PROVIDER_KEY: &str = "openai/gpt-4o";

/// Known OpenAI-compatible chat-completions endpoints.
fn base_url_for(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1/chat/completions"),
        "deepseek" => Some("https://api.deepseek.com/v1/chat/completions"),
        "openrouter" => Some("https://openrouter.ai/api/v1/chat/completions"),
        "groq" => Some("https://api.groq.com/openai/v1/chat/completions"),
        "moonshot" => Some("https://api.moonshot.cn/v1/chat/completions"),
        _ => None,
    }
}

/// Split a `provider/model` key. A bare model name maps to the default
/// provider.
pub fn parse_provider_key(key: &str) -> (String, String) {
    match key.split_once('/') {
        Some((provider, model)) => (provider.to_string(), model.to_string()),
        None => ("openai".to_string(), key.to_string()),
    }
}

/// Build a streaming client for a `provider/model` key, resolving the API key
/// through the credential chain (keys file, auth store, environment).
pub fn create_client(
    provider_key: Option<&str>,
    credentials: &Credentials,
) -> Result<Arc<dyn LlmClient>, SwarmError> {
    let key = provider_key.unwrap_or(DEFAULT_PROVIDER_KEY);
    let (provider, model) = parse_provider_key(key);
    let base_url = base_url_for(&provider).ok_or_else(|| {
        SwarmError::Config(format!(
            "Unknown provider '{}'. Known providers: openai, deepseek, openrouter, groq, moonshot.",
            provider
        ))
    })?;
    let api_key = credentials.key_for(&provider).ok_or_else(|| {
        SwarmError::Config(format!(
            "No API key for provider '{}'. Add it to keys.json, the auth store, or set {}_API_KEY.",
            provider,
            provider.to_uppercase()
        ))
    })?;
    Ok(Arc::new(openai::OpenAiClient::new(
        api_key,
        model,
        base_url.to_string(),
        provider,
    )))
}
