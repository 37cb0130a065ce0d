//! Anthropic messages API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{error_for_status, Generation, GenerationRequest, ProviderAdapter, ToolCallRequest};
use crate::domain::UsageCounters;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            base_url: ANTHROPIC_BASE_URL.to_string(),
            client,
        }
    }

    fn request_body(request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "system": request.instructions,
            "messages": [{ "role": "user", "content": request.full_input() }],
        });

        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }

        body
    }
}

/// Join text blocks; `tool_use` blocks become tool calls
fn parse_message(body: &Value) -> Result<Generation> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .context("Response has no content blocks")?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let Some(name) = block.get("name").and_then(Value::as_str) else {
                    continue;
                };
                tool_calls.push(ToolCallRequest {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }

    Ok(Generation {
        text: text.trim().to_string(),
        usage: body
            .get("usage")
            .map(UsageCounters::from_json)
            .unwrap_or_default(),
        tool_calls,
    })
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let api_key = request.require_api_key("anthropic")?;

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::request_body(&request))
            .send()
            .await
            .context("Failed to reach anthropic")?;
        let response = error_for_status("anthropic", response).await?;

        let body: Value = response
            .json()
            .await
            .context("Malformed response from anthropic")?;
        parse_message(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDefinition;

    #[test]
    fn test_parse_text_and_tool_use() {
        let body = json!({
            "content": [
                { "type": "text", "text": "Let me look " },
                { "type": "text", "text": "that up." },
                { "type": "tool_use", "id": "toolu_1", "name": "breach_search",
                  "input": { "term": "a@b.c", "search_type": "email" } }
            ],
            "usage": { "input_tokens": 20, "output_tokens": 9 }
        });

        let generation = parse_message(&body).unwrap();
        assert_eq!(generation.text, "Let me look that up.");
        assert_eq!(generation.tool_calls[0].id, "toolu_1");
        assert_eq!(generation.tool_calls[0].arguments["search_type"], "email");
        assert_eq!(generation.usage.get("output_tokens"), Some(9.0));
    }

    #[test]
    fn test_body_uses_input_schema_and_default_cap() {
        let mut request = GenerationRequest::new("claude-sonnet-4", "sys", "q");
        request.tools = vec![ToolDefinition::new(
            "web_search",
            "Search",
            json!({ "type": "object", "required": ["query"] }),
        )];

        let body = AnthropicAdapter::request_body(&request);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["tools"][0]["input_schema"]["required"][0], "query");
    }
}
