//! Provider adapters for external AI services.
//!
//! Every provider is reached through the same [`ProviderAdapter`] capability.
//! Adapters are registered by provider identifier in a [`ProviderRegistry`], so
//! adding a provider never touches the orchestrator.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::UsageCounters;
use crate::tools::ToolDefinition;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiCompatibleAdapter;

/// Receives incremental text while a generation streams
pub type StreamSink = mpsc::UnboundedSender<String>;

/// Header placed between the user input and prior tool results
pub const TOOL_CONTEXT_HEADER: &str = "--- Tool Results from Previous Iteration ---";

/// A model's request to invoke a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Normalized result of one generation call
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: UsageCounters,

    /// Empty when the model requested no tools (or the provider can't)
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: UsageCounters) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Everything an adapter needs for one call. Owned so it can cross task
/// boundaries.
#[derive(Clone, Default)]
pub struct GenerationRequest {
    pub model: String,
    pub instructions: String,
    pub input: String,
    pub api_key: Option<String>,
    pub tools: Vec<ToolDefinition>,

    /// Results of earlier tool iterations, appended to the input
    pub tool_context: Option<String>,

    pub max_output_tokens: Option<u32>,

    /// Streaming is best-effort; adapters without it ignore the sink
    pub stream: Option<StreamSink>,
}

impl GenerationRequest {
    pub fn new(
        model: impl Into<String>,
        instructions: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            instructions: instructions.into(),
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    /// User input with any prior tool results appended
    pub fn full_input(&self) -> String {
        input_with_tool_context(&self.input, self.tool_context.as_deref())
    }

    pub(crate) fn require_api_key(&self, provider: &str) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .with_context(|| format!("No API key supplied for provider {}", provider))
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("model", &self.model)
            .field("input_chars", &self.input.chars().count())
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("tools", &self.tools.len())
            .field("tool_context", &self.tool_context.is_some())
            .field("max_output_tokens", &self.max_output_tokens)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

pub fn input_with_tool_context(input: &str, tool_context: Option<&str>) -> String {
    match tool_context.filter(|c| !c.is_empty()) {
        Some(context) => format!("{}\n\n{}\n{}", input, TOOL_CONTEXT_HEADER, context),
        None => input.to_string(),
    }
}

/// Trait for AI provider adapters
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier (e.g. "openai")
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<Generation>;
}

/// Adapters keyed by provider identifier
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// openai, deepseek, xai, anthropic and gemini over one shared HTTP client
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiCompatibleAdapter::openai(client.clone())));
        registry.register(Arc::new(OpenAiCompatibleAdapter::deepseek(client.clone())));
        registry.register(Arc::new(OpenAiCompatibleAdapter::xai(client.clone())));
        registry.register(Arc::new(AnthropicAdapter::new(client.clone())));
        registry.register(Arc::new(GeminiAdapter::new(client)));
        registry
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.name().to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider.to_ascii_lowercase()).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

/// Read a `text/event-stream` body, calling `on_data` with each `data:` payload.
///
/// Stops at `[DONE]` or when the body ends.
pub(crate) async fn read_sse_data<F>(mut response: reqwest::Response, mut on_data: F) -> Result<()>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read streaming response")?
    {
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(());
                }
                if !data.is_empty() {
                    on_data(data)?;
                }
            }
        }
    }

    Ok(())
}

/// Turn a non-success response into an error carrying a bounded body excerpt
pub(crate) async fn error_for_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(500).collect();
    anyhow::bail!("{} API error ({}): {}", provider, status, excerpt)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ProviderAdapter for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
            Ok(Generation::text(request.full_input()))
        }
    }

    #[test]
    fn test_tool_context_is_appended() {
        assert_eq!(input_with_tool_context("q", None), "q");
        assert_eq!(input_with_tool_context("q", Some("")), "q");
        assert_eq!(
            input_with_tool_context("q", Some("[Web Search] none")),
            "q\n\n--- Tool Results from Previous Iteration ---\n[Web Search] none"
        );
    }

    #[test]
    fn test_request_debug_redacts_key() {
        let request = GenerationRequest::new("gpt-4o", "be precise", "hi").with_api_key("sk-secret");
        let printed = format!("{:?}", request);
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_registry_lookup_is_case_insensitive() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Echo));

        let adapter = registry.get("ECHO").unwrap();
        let generation = adapter
            .generate(GenerationRequest::new("m", "i", "hello"))
            .await
            .unwrap();
        assert_eq!(generation.text, "hello");
        assert!(registry.get("openai").is_none());
    }

    #[test]
    fn test_default_providers() {
        let registry = ProviderRegistry::with_defaults(reqwest::Client::new());
        assert_eq!(
            registry.providers(),
            vec!["anthropic", "deepseek", "gemini", "openai", "xai"]
        );
    }
}
