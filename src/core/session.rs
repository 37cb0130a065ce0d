//! Bounded tool-calling loop for one pass.

use std::sync::Arc;

use tracing::{debug, info};

use crate::adapters::{GenerationRequest, StreamSink};
use crate::domain::UsageCounters;
use crate::tools::{ToolExecutor, ToolInvocation};

use super::executor::{ExecutorError, ProviderExecutor};

/// Provider calls allowed per pass
pub const MAX_TOOL_ITERATIONS: usize = 3;

/// Input for one session
#[derive(Debug)]
pub struct SessionRequest {
    pub provider: String,

    /// Base request; tools and tool context are filled in per iteration
    pub generation: GenerationRequest,

    /// Receives text from the first iteration only
    pub stream: Option<StreamSink>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    /// Text of the last iteration
    pub text: String,

    /// Usage summed across iterations
    pub usage: UsageCounters,

    pub iterations: usize,
    pub tool_invocations: Vec<ToolInvocation>,
}

pub struct ToolSession {
    executor: Arc<ProviderExecutor>,
    tools: Arc<dyn ToolExecutor>,
}

impl ToolSession {
    pub fn new(executor: Arc<ProviderExecutor>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self { executor, tools }
    }

    /// Run until the model stops asking for tools or the iteration cap is
    /// hit. Any provider error aborts the session.
    pub async fn run(&self, request: SessionRequest) -> Result<SessionOutcome, ExecutorError> {
        let SessionRequest {
            provider,
            generation,
            mut stream,
        } = request;
        let definitions = self.tools.definitions();

        let mut outcome = SessionOutcome::default();
        let mut tool_context = String::new();

        for iteration in 0..MAX_TOOL_ITERATIONS {
            let mut call = generation.clone();
            call.tools = definitions.clone();
            call.tool_context = (!tool_context.is_empty()).then(|| tool_context.clone());
            call.stream = stream.take();

            let result = self.executor.generate(&provider, call).await?;
            outcome.usage.merge(&result.usage);
            outcome.text = result.text;
            outcome.iterations = iteration + 1;

            if result.tool_calls.is_empty() {
                break;
            }
            if iteration + 1 == MAX_TOOL_ITERATIONS {
                debug!(
                    provider = %provider,
                    pending = result.tool_calls.len(),
                    "Tool iteration limit reached; keeping last response"
                );
                break;
            }

            let mut formatted = Vec::with_capacity(result.tool_calls.len());
            for tool_call in result.tool_calls {
                info!(
                    tool = %tool_call.name,
                    iteration,
                    "Executing tool"
                );
                let value = self
                    .tools
                    .execute(&tool_call.name, tool_call.arguments.clone())
                    .await;
                let text = self.tools.format_result(&tool_call.name, &value);
                formatted.push(text.clone());
                outcome.tool_invocations.push(ToolInvocation {
                    name: tool_call.name,
                    arguments: tool_call.arguments,
                    result_text: text,
                });
            }

            let new_context = formatted.join("\n\n");
            if tool_context.is_empty() {
                tool_context = new_context;
            } else {
                tool_context.push_str("\n\n");
                tool_context.push_str(&new_context);
            }
        }

        Ok(outcome)
    }
}
