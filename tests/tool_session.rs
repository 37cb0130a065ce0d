//! Tool Session Integration Tests
//!
//! Tests for the bounded tool loop: iteration cap, early exit once the model
//! answers, streaming on the first call only, usage accumulation and abort
//! on provider errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use chriseon::adapters::{
    Generation, GenerationRequest, ProviderAdapter, ProviderRegistry, ToolCallRequest,
};
use chriseon::core::{
    ExecutionMode, ExecutorError, ProviderExecutor, SessionRequest, ToolSession,
    MAX_TOOL_ITERATIONS,
};
use chriseon::domain::UsageCounters;
use chriseon::tools::{ToolDefinition, ToolExecutor};

/// Asks for a search on every call until `fail_on` (1-based), if set.
/// From call `answer_on` on it replies with text only.
struct ToolHungryModel {
    calls: AtomicUsize,
    fail_on: Option<usize>,
    answer_on: Option<usize>,
    streamed: Mutex<Vec<bool>>,
    tool_counts: Mutex<Vec<usize>>,
    contexts: Mutex<Vec<Option<String>>>,
}

impl ToolHungryModel {
    fn new(fail_on: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on,
            answer_on: None,
            streamed: Mutex::new(Vec::new()),
            tool_counts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    fn answering_on(call: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on: None,
            answer_on: Some(call),
            streamed: Mutex::new(Vec::new()),
            tool_counts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ToolHungryModel {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.streamed.lock().unwrap().push(request.stream.is_some());
        self.tool_counts.lock().unwrap().push(request.tools.len());
        self.contexts.lock().unwrap().push(request.tool_context.clone());

        if self.fail_on == Some(call) {
            anyhow::bail!("upstream 500");
        }
        if let Some(stream) = &request.stream {
            let _ = stream.send(format!("chunk {}", call));
        }

        let usage: UsageCounters = [("output_tokens".to_string(), 5.0)].into_iter().collect();
        if self.answer_on.map_or(false, |n| call >= n) {
            return Ok(Generation::text(format!("final answer {}", call)).with_usage(usage));
        }
        Ok(Generation::text(format!("answer {}", call))
            .with_usage(usage)
            .with_tool_calls(vec![ToolCallRequest {
                id: format!("call_{}", call),
                name: "web_search".to_string(),
                arguments: json!({ "query": format!("q{}", call) }),
            }]))
    }
}

#[derive(Default)]
struct CountingTools {
    executed: AtomicUsize,
}

#[async_trait]
impl ToolExecutor for CountingTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "web_search",
            "Search the web",
            json!({ "type": "object" }),
        )]
    }

    async fn execute(&self, _name: &str, arguments: Value) -> Value {
        self.executed.fetch_add(1, Ordering::SeqCst);
        json!({ "echo": arguments["query"] })
    }

    fn format_result(&self, name: &str, result: &Value) -> String {
        format!("[{}] {}", name, result["echo"].as_str().unwrap_or_default())
    }
}

fn session(model: Arc<ToolHungryModel>, tools: Arc<CountingTools>) -> ToolSession {
    let mut registry = ProviderRegistry::new();
    registry.register(model);
    let executor = ProviderExecutor::new(
        Arc::new(registry),
        ExecutionMode::Inline,
        Duration::from_secs(5),
    );
    ToolSession::new(Arc::new(executor), tools)
}

fn request(stream: Option<tokio::sync::mpsc::UnboundedSender<String>>) -> SessionRequest {
    SessionRequest {
        provider: "openai".to_string(),
        generation: GenerationRequest::new("gpt-4o", "Be precise.", "What changed in Rust 2024?"),
        stream,
    }
}

#[tokio::test]
async fn test_iterations_are_capped() {
    let model = ToolHungryModel::new(None);
    let tools = Arc::new(CountingTools::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let outcome = session(model.clone(), tools.clone())
        .run(request(Some(tx)))
        .await
        .unwrap();

    assert_eq!(model.calls.load(Ordering::SeqCst), MAX_TOOL_ITERATIONS);
    assert_eq!(outcome.iterations, MAX_TOOL_ITERATIONS);
    assert_eq!(outcome.text, "answer 3");

    // Tool calls on the last iteration are not executed
    assert_eq!(tools.executed.load(Ordering::SeqCst), MAX_TOOL_ITERATIONS - 1);
    assert_eq!(outcome.tool_invocations.len(), MAX_TOOL_ITERATIONS - 1);
    assert_eq!(outcome.tool_invocations[1].result_text, "[web_search] q2");

    // Usage summed over every call
    assert_eq!(outcome.usage.get("output_tokens"), Some(15.0));

    // Only the first call streams, and every call sees the tool schemas
    assert_eq!(*model.streamed.lock().unwrap(), vec![true, false, false]);
    assert_eq!(*model.tool_counts.lock().unwrap(), vec![1, 1, 1]);
    assert_eq!(rx.recv().await.as_deref(), Some("chunk 1"));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_session_ends_when_model_stops_asking() {
    let model = ToolHungryModel::answering_on(2);
    let tools = Arc::new(CountingTools::default());

    let outcome = session(model.clone(), tools.clone())
        .run(request(None))
        .await
        .unwrap();

    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.text, "final answer 2");
    assert_eq!(tools.executed.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.tool_invocations.len(), 1);
    assert_eq!(outcome.usage.get("output_tokens"), Some(10.0));

    // The follow-up call carries the first call's tool results
    assert_eq!(
        *model.contexts.lock().unwrap(),
        vec![None, Some("[web_search] q1".to_string())]
    );
}

#[tokio::test]
async fn test_provider_error_aborts_session() {
    let model = ToolHungryModel::new(Some(2));
    let tools = Arc::new(CountingTools::default());

    let err = session(model.clone(), tools.clone())
        .run(request(None))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutorError::Provider(ref m) if m.contains("upstream 500")));
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(tools.executed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_provider_is_an_error() {
    let model = ToolHungryModel::new(None);
    let tools = Arc::new(CountingTools::default());

    let mut req = request(None);
    req.provider = "mistral".to_string();
    let err = session(model, tools).run(req).await.unwrap_err();
    assert_eq!(err.to_string(), "unsupported provider: mistral");
}
