//! OpenAI-compatible chat completions.
//!
//! Serves openai itself plus the providers that expose the same API shape
//! (deepseek, xai) at a different base URL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{error_for_status, read_sse_data, Generation, GenerationRequest, ProviderAdapter, ToolCallRequest};
use crate::domain::UsageCounters;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

/// Chat-completions adapter
pub struct OpenAiCompatibleAdapter {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn openai(client: reqwest::Client) -> Self {
        Self::new("openai", OPENAI_BASE_URL, client)
    }

    pub fn deepseek(client: reqwest::Client) -> Self {
        Self::new("deepseek", DEEPSEEK_BASE_URL, client)
    }

    pub fn xai(client: reqwest::Client) -> Self {
        Self::new("xai", XAI_BASE_URL, client)
    }

    fn request_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.instructions },
                { "role": "user", "content": request.full_input() },
            ],
        });

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| t.to_openai_function())
                    .collect(),
            );
            body["tool_choice"] = json!("auto");
        }
        if let Some(max) = request.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }
}

/// Extract text, usage and tool calls from a non-streaming response body
pub(crate) fn parse_completion(body: &Value) -> Result<Generation> {
    let message = body
        .pointer("/choices/0/message")
        .context("Response has no choices")?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    let usage = body
        .get("usage")
        .map(UsageCounters::from_json)
        .unwrap_or_default();

    Ok(Generation {
        text,
        usage,
        tool_calls,
    })
}

fn parse_tool_call(call: &Value) -> Option<ToolCallRequest> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();

    // Arguments arrive as a JSON-encoded string
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
        }
        Some(other) => other.clone(),
        None => Value::Object(Default::default()),
    };

    Some(ToolCallRequest {
        id: call
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("call_{}", name)),
        name,
        arguments,
    })
}

/// Tool call assembled from streamed deltas
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates a streamed chat completion.
///
/// Tool calls arrive as fragments keyed by `index`; the id and name come
/// once and the arguments string is split across frames. Usage comes in a
/// final frame with empty `choices`.
#[derive(Debug, Default)]
pub(crate) struct ChatStream {
    text: String,
    tool_calls: Vec<PartialToolCall>,
    usage: UsageCounters,
}

impl ChatStream {
    /// Apply one `data:` payload, returning the text delta it carried
    pub(crate) fn push(&mut self, data: &str) -> Result<Option<String>> {
        let event: Value = serde_json::from_str(data).context("Malformed stream event")?;

        if let Some(usage) = event.get("usage").filter(|u| u.is_object()) {
            self.usage.merge(&UsageCounters::from_json(usage));
        }

        let Some(delta) = event.pointer("/choices/0/delta") else {
            return Ok(None);
        };

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(self.tool_calls.len() as u64) as usize;
                if self.tool_calls.len() <= index {
                    self.tool_calls.resize_with(index + 1, PartialToolCall::default);
                }
                let slot = &mut self.tool_calls[index];

                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    slot.id = Some(id.to_string());
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    slot.name.push_str(name);
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    slot.arguments.push_str(args);
                }
            }
        }

        let text = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        if let Some(t) = &text {
            self.text.push_str(t);
        }
        Ok(text)
    }

    pub(crate) fn finish(self) -> Generation {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let arguments = if c.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or(Value::String(c.arguments))
                };
                ToolCallRequest {
                    id: c.id.unwrap_or_else(|| format!("call_{}", c.name)),
                    name: c.name,
                    arguments,
                }
            })
            .collect();

        Generation::text(self.text)
            .with_usage(self.usage)
            .with_tool_calls(tool_calls)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let api_key = request.require_api_key(&self.name)?;
        let streaming = request.stream.is_some();
        let body = self.request_body(&request, streaming);

        debug!(provider = %self.name, model = %request.model, streaming, "Sending chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.name))?;
        let response = error_for_status(&self.name, response).await?;

        match request.stream {
            Some(sink) => {
                let mut stream = ChatStream::default();
                read_sse_data(response, |data| {
                    let delta = stream
                        .push(data)
                        .with_context(|| format!("Bad stream from {}", self.name))?;
                    if let Some(delta) = delta {
                        let _ = sink.send(delta);
                    }
                    Ok(())
                })
                .await?;
                Ok(stream.finish())
            }
            None => {
                let body: Value = response
                    .json()
                    .await
                    .with_context(|| format!("Malformed response from {}", self.name))?;
                parse_completion(&body)
            }
        }
    }
}
