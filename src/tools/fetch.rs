//! Single-URL fetch tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::html::{truncate_chars, HtmlText};
use super::net::{check_public_url, fetch_client, read_capped};
use super::{required_str, Tool, ToolDefinition, ToolError, ToolResult};

/// Bytes read from a fetched page
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Characters of page text handed to the model
const MAX_CONTENT_CHARS: usize = 10_000;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; ChriseonBot/1.0)";

pub struct FetchUrlTool {
    definition: ToolDefinition,
    client: reqwest::Client,
    html: HtmlText,
}

impl FetchUrlTool {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            definition: ToolDefinition::new(
                "fetch_url",
                "Fetch and extract text content from a specific URL. Use this to read articles, \
                 documentation, or web pages. Returns cleaned text content.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": {
                            "type": "string",
                            "description": "The full URL to fetch (must start with http:// or https://)"
                        }
                    },
                    "required": ["url"]
                }),
            ),
            client: fetch_client(USER_AGENT)?,
            html: HtmlText::new()?,
        })
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let raw = required_str(&arguments, "url")?;
        let url = check_public_url(raw).await?;

        debug!(url = %url, "Fetching URL for model");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolError::Network(format!("Failed to fetch: {}", e)))?;

        if !response.status().is_success() {
            return Err(ToolError::Upstream(format!(
                "Failed to fetch: HTTP {}",
                response.status()
            )));
        }

        let body = read_capped(response, MAX_BODY_BYTES).await?;
        let page = String::from_utf8_lossy(&body);

        let title = self.html.title(&page).unwrap_or_default();
        let content = truncate_chars(&self.html.readable_text(&page), MAX_CONTENT_CHARS);
        let length = content.chars().count();

        Ok(json!({
            "url": raw,
            "title": title,
            "content": content,
            "length": length,
        }))
    }

    fn format(&self, result: &Value) -> String {
        let field = |key: &str| result.get(key).and_then(Value::as_str).unwrap_or_default();
        let title = Some(field("title")).filter(|t| !t.is_empty()).unwrap_or("N/A");
        format!(
            "[URL Content: {}]\nTitle: {}\n\n{}",
            field("url"),
            title,
            field("content")
        )
    }
}
