//! Web search via the DuckDuckGo HTML endpoint (no API key required).

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::html::decode_entities;
use super::{required_str, Tool, ToolDefinition, ToolError, ToolResult};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const DEFAULT_NUM_RESULTS: usize = 5;
const MAX_NUM_RESULTS: usize = 10;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

pub struct WebSearchTool {
    definition: ToolDefinition,
    client: reqwest::Client,
    endpoint: String,
    parser: ResultParser,
}

impl WebSearchTool {
    pub fn new(client: reqwest::Client) -> Result<Self, regex::Error> {
        let definition = ToolDefinition::new(
            "web_search",
            "Search the web for current information. Use this when you need to research a topic, \
             find recent data, or verify facts. Returns snippets and URLs from search results.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query. Be specific and concise."
                    },
                    "num_results": {
                        "type": "integer",
                        "description": "Number of results to return (default: 5, max: 10)",
                        "default": DEFAULT_NUM_RESULTS
                    }
                },
                "required": ["query"]
            }),
        );

        Ok(Self {
            definition,
            client,
            endpoint: SEARCH_ENDPOINT.to_string(),
            parser: ResultParser::new()?,
        })
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let query = required_str(&arguments, "query")?;
        let num_results = arguments
            .get("num_results")
            .and_then(Value::as_u64)
            .map(|n| (n as usize).clamp(1, MAX_NUM_RESULTS))
            .unwrap_or(DEFAULT_NUM_RESULTS);

        debug!(query = %query, num_results, "Searching the web");

        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query));
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| ToolError::Network(format!("Search failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ToolError::Upstream(format!(
                "Search failed: HTTP {}",
                response.status()
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| ToolError::Network(format!("Search failed: {}", e)))?;

        let results = self.parser.parse(&html, num_results);
        Ok(json!({
            "results": results,
            "query": query,
            "count": results.len(),
        }))
    }

    fn format(&self, result: &Value) -> String {
        let query = result.get("query").and_then(Value::as_str).unwrap_or_default();
        let hits = result
            .get("results")
            .and_then(Value::as_array)
            .filter(|hits| !hits.is_empty());

        let Some(hits) = hits else {
            return format!("[Web Search] No results found for: {}", query);
        };

        let mut output = format!("[Web Search Results for: {}]\n\n", query);
        for (i, hit) in hits.iter().enumerate() {
            let field = |key: &str| hit.get(key).and_then(Value::as_str).unwrap_or_default();
            output.push_str(&format!(
                "{}. {}\n   {}\n   URL: {}\n\n",
                i + 1,
                field("title"),
                field("snippet"),
                field("url")
            ));
        }
        output.trim_end().to_string()
    }
}

/// Pulls title/snippet/url triples out of a results page
#[derive(Debug, Clone)]
struct ResultParser {
    title: Regex,
    snippet: Regex,
    tag: Regex,
}

impl ResultParser {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            title: Regex::new(r#"(?s)<a[^>]+class="result__a"[^>]+href="([^"]*)"[^>]*>(.*?)</a>"#)?,
            snippet: Regex::new(r#"(?s)<a[^>]+class="result__snippet"[^>]*>(.*?)</a>"#)?,
            tag: Regex::new(r"<[^>]+>")?,
        })
    }

    fn parse(&self, html: &str, limit: usize) -> Vec<SearchHit> {
        let snippets: Vec<String> = self
            .snippet
            .captures_iter(html)
            .map(|cap| self.strip(cap.get(1).map_or("", |m| m.as_str())))
            .collect();

        self.title
            .captures_iter(html)
            .enumerate()
            .map(|(i, cap)| SearchHit {
                title: self.strip(cap.get(2).map_or("", |m| m.as_str())),
                url: real_url(cap.get(1).map_or("", |m| m.as_str())),
                snippet: snippets.get(i).cloned().unwrap_or_default(),
            })
            .filter(|hit| !hit.title.is_empty() && !hit.url.is_empty())
            .take(limit)
            .collect()
    }

    fn strip(&self, fragment: &str) -> String {
        decode_entities(&self.tag.replace_all(fragment, ""))
            .trim()
            .to_string()
    }
}

/// Result links go through a redirect (`//duckduckgo.com/l/?uddg=<url>&...`)
fn real_url(raw: &str) -> String {
    let raw = decode_entities(raw);
    match raw.find("uddg=") {
        Some(pos) => {
            let rest = &raw[pos + 5..];
            let encoded = &rest[..rest.find('&').unwrap_or(rest.len())];
            urlencoding::decode(encoded)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| encoded.to_string())
        }
        None => raw,
    }
}
