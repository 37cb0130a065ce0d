//! Breach/OSINT lookup through the BreachVIP search API.
//!
//! The public API allows 15 requests per minute. Each client instance keeps
//! its own minimum-interval gate; there is no cross-process coordination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{required_str, Tool, ToolDefinition, ToolError, ToolResult};

pub const BREACH_VIP_BASE_URL: &str = "https://breach.vip";
const RATE_LIMIT_PER_MINUTE: u32 = 15;
const MAX_TERM_CHARS: usize = 100;
const DEFAULT_MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RATE_LIMITED_BACKOFF: Duration = Duration::from_secs(60);

/// Fields the search API can match on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchField {
    Email,
    Username,
    Domain,
    Ip,
}

impl SearchField {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "username" => Some(Self::Username),
            "domain" => Some(Self::Domain),
            "ip" => Some(Self::Ip),
            _ => None,
        }
    }
}

/// One matching breach record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreachRecord {
    pub source: String,
    pub categories: Value,

    /// Every other field the API returned
    pub data: Map<String, Value>,
}

impl BreachRecord {
    fn from_api(item: Value) -> Self {
        let mut fields = match item {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let source = match fields.remove("source") {
            Some(Value::String(s)) => s,
            _ => "Unknown".to_string(),
        };
        let categories = fields.remove("categories").unwrap_or_else(|| json!([]));

        Self {
            source,
            categories,
            data: fields,
        }
    }
}

/// Minimum spacing between consecutive requests
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Gate for a per-minute request allowance
    pub fn per_minute(requests: u32) -> Self {
        Self::new(Duration::from_secs(60) / requests.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request may go out, then claim the slot
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// BreachVIP API client
#[derive(Debug)]
pub struct BreachVipClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    gate: RateGate,
}

impl BreachVipClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: BREACH_VIP_BASE_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            gate: RateGate::per_minute(RATE_LIMIT_PER_MINUTE),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Search for `term` in the given fields
    pub async fn search(&self, term: &str, fields: &[SearchField]) -> Result<Vec<BreachRecord>, ToolError> {
        let term = term.trim();
        let chars = term.chars().count();
        if chars == 0 || chars > MAX_TERM_CHARS {
            return Err(ToolError::InvalidInput(format!(
                "Search term must be 1-{} characters",
                MAX_TERM_CHARS
            )));
        }
        if fields.is_empty() {
            return Err(ToolError::InvalidInput(
                "At least one search field is required".to_string(),
            ));
        }

        self.gate.wait().await;

        let body = json!({ "term": term, "fields": fields });
        let url = format!("{}/api/search", self.base_url);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last_attempt = attempt >= self.max_retries;

            let response = match self
                .client
                .post(&url)
                .header("Accept", "application/json")
                .timeout(REQUEST_TIMEOUT)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if !last_attempt => {
                    warn!(attempt, error = %e, "Breach search request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                    continue;
                }
                Err(e) => return Err(ToolError::Network(format!("Request failed: {}", e))),
            };

            let status = response.status();
            if status.as_u16() == 429 {
                if last_attempt {
                    return Err(ToolError::Upstream(
                        "Rate limit exceeded. Try again later.".to_string(),
                    ));
                }
                warn!(attempt, "Breach search rate limited, backing off");
                tokio::time::sleep(RATE_LIMITED_BACKOFF).await;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(if status.as_u16() == 400 {
                    ToolError::InvalidInput(format!("Bad request: {}", text))
                } else {
                    ToolError::Upstream(format!("HTTP {}: {}", status.as_u16(), text))
                });
            }

            match response.json::<Value>().await {
                Ok(payload) => {
                    let results = payload
                        .get("results")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    debug!(count = results.len(), "Breach search returned");
                    return Ok(results.into_iter().map(BreachRecord::from_api).collect());
                }
                Err(e) if !last_attempt => {
                    warn!(attempt, error = %e, "Malformed breach search response, retrying");
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
                Err(e) => return Err(ToolError::Upstream(format!("Request failed: {}", e))),
            }
        }
    }
}

/// `breach_search` tool over a shared client
pub struct BreachSearchTool {
    definition: ToolDefinition,
    client: Arc<BreachVipClient>,
}

impl BreachSearchTool {
    pub fn new(client: Arc<BreachVipClient>) -> Self {
        Self {
            definition: ToolDefinition::new(
                "breach_search",
                "Search data breach databases for exposed credentials, emails, or usernames. \
                 Use for security research or OSINT investigations. Returns breach sources and exposed data.",
                json!({
                    "type": "object",
                    "properties": {
                        "term": {
                            "type": "string",
                            "description": "Email, username, or identifier to search for"
                        },
                        "search_type": {
                            "type": "string",
                            "enum": ["email", "username", "domain", "ip"],
                            "description": "Type of identifier being searched"
                        }
                    },
                    "required": ["term", "search_type"]
                }),
            ),
            client,
        }
    }
}

#[async_trait]
impl Tool for BreachSearchTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let term = required_str(&arguments, "term")?;
        let search_type = required_str(&arguments, "search_type")?;
        let field = SearchField::parse(search_type).ok_or_else(|| {
            ToolError::InvalidInput(format!("Unsupported search_type: {}", search_type))
        })?;

        let records = self.client.search(term, &[field]).await?;
        Ok(json!({
            "term": term,
            "search_type": field,
            "results": records,
            "total": records.len(),
        }))
    }

    fn format(&self, result: &Value) -> String {
        let term = result.get("term").and_then(Value::as_str).unwrap_or_default();
        let Some(records) = result
            .get("results")
            .and_then(Value::as_array)
            .filter(|r| !r.is_empty())
        else {
            return format!("[Breach Search] No breaches found for: {}", term);
        };

        let mut output = format!("[Breach Search for: {}]\n\n", term);
        for record in records {
            let source = record
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            let data = record.get("data").cloned().unwrap_or_else(|| json!({}));
            output.push_str(&format!(
                "- Source: {}\n  Data: {}\n\n",
                source,
                serde_json::to_string_pretty(&data).unwrap_or_default()
            ));
        }
        output.trim_end().to_string()
    }
}
