//! Model-callable tools.
//!
//! Tools are exposed to providers as function-calling schemas. A failing or
//! unknown tool never aborts a pass: it yields an `{"error": ...}` result,
//! which is formatted and fed back to the model like any other result.

pub mod breach;
pub mod fetch;
pub mod html;
pub mod net;
pub mod web_search;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

pub use breach::{BreachSearchTool, BreachVipClient};
pub use fetch::FetchUrlTool;
pub use web_search::WebSearchTool;

/// Tool schema in function-calling form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,

    /// JSON schema for the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// `{"type": "function", "function": {...}}` as chat-completions APIs expect
    pub fn to_openai_function(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidInput(String),

    /// Target address is private, loopback or link-local
    #[error("{0}")]
    Blocked(String),

    #[error("{0}")]
    Network(String),

    #[error("{0}")]
    Upstream(String),
}

pub type ToolResult = Result<Value, ToolError>;

/// A single tool implementation
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    async fn execute(&self, arguments: Value) -> ToolResult;

    /// Render a successful result as text for the model
    fn format(&self, result: &Value) -> String {
        format!(
            "[{}]\n{}",
            self.definition().name,
            serde_json::to_string_pretty(result).unwrap_or_default()
        )
    }
}

/// What the tool-calling loop needs from a tool collection
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Never fails: errors come back as `{"error": ...}`
    async fn execute(&self, name: &str, arguments: Value) -> Value;

    fn format_result(&self, name: &str, result: &Value) -> String;
}

/// One executed tool call. Lives only for the iteration that made it.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub result_text: String,
}

/// Registered tools in registration order
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// web_search, fetch_url and breach_search over one HTTP client
    pub fn with_defaults(client: reqwest::Client) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(WebSearchTool::new(client.clone())?));
        registry.register(Arc::new(FetchUrlTool::new()?));
        registry.register(Arc::new(BreachSearchTool::new(Arc::new(
            BreachVipClient::new(client),
        ))));
        Ok(registry)
    }

    /// Register a tool, replacing one with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        self.tools.retain(|t| t.definition().name != name);
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(|t| t.definition().name.as_str())
            .collect()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition().clone()).collect()
    }

    async fn execute(&self, name: &str, arguments: Value) -> Value {
        let Some(tool) = self.get(name) else {
            warn!(tool = %name, "Model requested an unknown tool");
            return json!({ "error": format!("Unknown tool: {}", name) });
        };

        info!(tool = %name, "Executing tool");
        match tool.execute(arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                json!({ "error": e.to_string() })
            }
        }
    }

    fn format_result(&self, name: &str, result: &Value) -> String {
        if let Some(error) = result.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return format!("[{} Error] {}", name, message);
        }

        match self.get(name) {
            Some(tool) => tool.format(result),
            None => format!(
                "[{}]\n{}",
                name,
                serde_json::to_string_pretty(result).unwrap_or_default()
            ),
        }
    }
}

/// Required string argument
pub(crate) fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidInput(format!("Missing '{}' parameter", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fails;

    #[async_trait]
    impl Tool for Fails {
        fn definition(&self) -> &ToolDefinition {
            static DEF: std::sync::OnceLock<ToolDefinition> = std::sync::OnceLock::new();
            DEF.get_or_init(|| ToolDefinition::new("fails", "Always fails", json!({})))
        }

        async fn execute(&self, _arguments: Value) -> ToolResult {
            Err(ToolError::Upstream("service unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_yields_error_result() {
        let registry = ToolRegistry::new();
        let result = registry.execute("telepathy", json!({})).await;
        assert_eq!(result["error"], "Unknown tool: telepathy");
        assert_eq!(
            registry.format_result("telepathy", &result),
            "[telepathy Error] Unknown tool: telepathy"
        );
    }

    #[tokio::test]
    async fn test_failing_tool_is_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Fails));

        let result = registry.execute("fails", json!({})).await;
        assert_eq!(
            registry.format_result("fails", &result),
            "[fails Error] service unavailable"
        );
    }

    #[test]
    fn test_default_tool_set() {
        let registry = ToolRegistry::with_defaults(reqwest::Client::new()).unwrap();
        assert_eq!(registry.names(), vec!["web_search", "fetch_url", "breach_search"]);

        let schema = registry.definitions()[0].to_openai_function();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["parameters"]["required"][0], "query");
    }
}
