//! Google Gemini `generateContent`.
//!
//! Gemini reports no call ids for function calls, so ids are synthesized as
//! `call_<name>`. Usage comes from `usageMetadata`; streamed chunks repeat it
//! cumulatively, so the last one wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{error_for_status, read_sse_data, Generation, GenerationRequest, ProviderAdapter, ToolCallRequest};
use crate::domain::UsageCounters;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            base_url: GEMINI_BASE_URL.to_string(),
            client,
        }
    }

    fn model_path(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        }
    }

    fn request_body(request: &GenerationRequest) -> Value {
        let mut body = json!({
            "systemInstruction": { "parts": [{ "text": request.instructions }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.full_input() }] }],
        });

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        if let Some(max) = request.max_output_tokens {
            body["generationConfig"] = json!({ "maxOutputTokens": max });
        }

        body
    }
}

fn candidate_parts(body: &Value) -> &[Value] {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn function_call(part: &Value) -> Option<ToolCallRequest> {
    let call = part.get("functionCall")?;
    let name = call.get("name")?.as_str()?;
    Some(ToolCallRequest {
        id: format!("call_{}", name),
        name: name.to_string(),
        arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
    })
}

fn usage_metadata(body: &Value) -> Option<UsageCounters> {
    body.get("usageMetadata")
        .filter(|u| u.is_object())
        .map(UsageCounters::from_json)
}

fn parse_response(body: &Value) -> Generation {
    let mut stream = GeminiStream::default();
    stream.apply(body);
    let mut generation = stream.finish();
    generation.text = generation.text.trim().to_string();
    generation
}

/// Accumulates `streamGenerateContent` chunks
#[derive(Debug, Default)]
pub(crate) struct GeminiStream {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<UsageCounters>,
}

impl GeminiStream {
    /// Apply one `data:` payload, returning the text it carried
    pub(crate) fn push(&mut self, data: &str) -> Result<Option<String>> {
        let event: Value = serde_json::from_str(data).context("Malformed stream event from gemini")?;
        Ok(self.apply(&event))
    }

    fn apply(&mut self, chunk: &Value) -> Option<String> {
        let mut delta = String::new();
        for part in candidate_parts(chunk) {
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                delta.push_str(t);
            } else if let Some(call) = function_call(part) {
                self.tool_calls.push(call);
            }
        }
        if let Some(usage) = usage_metadata(chunk) {
            self.usage = Some(usage);
        }

        if delta.is_empty() {
            return None;
        }
        self.text.push_str(&delta);
        Some(delta)
    }

    pub(crate) fn finish(self) -> Generation {
        Generation::text(self.text)
            .with_usage(self.usage.unwrap_or_default())
            .with_tool_calls(self.tool_calls)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let api_key = request.require_api_key("gemini")?;
        let model = Self::model_path(&request.model);

        let url = match request.stream {
            Some(_) => format!("{}/{}:streamGenerateContent?alt=sse", self.base_url, model),
            None => format!("{}/{}:generateContent", self.base_url, model),
        };

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&Self::request_body(&request))
            .send()
            .await
            .context("Failed to reach gemini")?;
        let response = error_for_status("gemini", response).await?;

        match request.stream {
            Some(sink) => {
                let mut stream = GeminiStream::default();
                read_sse_data(response, |data| {
                    if let Some(delta) = stream.push(data)? {
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
                    .context("Malformed response from gemini")?;
                Ok(parse_response(&body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_calls_get_synthesized_ids() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Searching." },
                    { "functionCall": { "name": "web_search", "args": { "query": "tokio" } } }
                ]}
            }]
        });

        let generation = parse_response(&body);
        assert_eq!(generation.text, "Searching.");
        assert_eq!(generation.tool_calls[0].id, "call_web_search");
        assert_eq!(generation.tool_calls[0].arguments["query"], "tokio");
        assert!(generation.usage.is_empty());
    }

    #[test]
    fn test_empty_candidates() {
        let generation = parse_response(&json!({}));
        assert_eq!(generation.text, "");
        assert!(generation.tool_calls.is_empty());
    }

    #[test]
    fn test_streamed_function_call_and_usage_survive() {
        let frames = [
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Checking "}]}}],"usageMetadata":{"promptTokenCount":12,"totalTokenCount":12}}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"docs."},{"functionCall":{"name":"fetch_url","args":{"url":"https://docs.rs"}}}]}}],"usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":7,"totalTokenCount":19}}"#,
        ];

        let mut stream = GeminiStream::default();
        let mut forwarded = Vec::new();
        for frame in frames {
            if let Some(delta) = stream.push(frame).unwrap() {
                forwarded.push(delta);
            }
        }
        let generation = stream.finish();

        assert_eq!(forwarded, vec!["Checking ", "docs."]);
        assert_eq!(generation.text, "Checking docs.");
        assert_eq!(generation.tool_calls.len(), 1);
        assert_eq!(generation.tool_calls[0].id, "call_fetch_url");
        assert_eq!(generation.tool_calls[0].arguments["url"], "https://docs.rs");
        assert_eq!(generation.usage.get("promptTokenCount"), Some(12.0));
        assert_eq!(generation.usage.get("candidatesTokenCount"), Some(7.0));
        assert_eq!(generation.usage.get("totalTokenCount"), Some(19.0));
    }

    #[test]
    fn test_model_path() {
        assert_eq!(GeminiAdapter::model_path("gemini-2.0-flash"), "models/gemini-2.0-flash");
        assert_eq!(GeminiAdapter::model_path("models/x"), "models/x");
    }
}
