//! Provider call execution with a hard timeout and crash containment.
//!
//! Two interchangeable strategies implement [`CallIsolation`]:
//! - [`InlineCall`]: awaits the adapter directly on the calling task
//! - [`IsolatedCall`]: runs the adapter on its own task and receives the
//!   result over a single-slot channel; the task is aborted on timeout and a
//!   panic inside it surfaces as [`ExecutorError::Crashed`]
//!
//! The strategy is picked once from configuration.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use crate::adapters::{Generation, GenerationRequest, ProviderAdapter, ProviderRegistry};

/// Wall-clock budget for one provider call
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Inline,
    #[default]
    Isolated,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Some(Self::Inline),
            "isolated" | "subprocess" => Some(Self::Isolated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Isolated => "isolated",
        }
    }
}

/// Failures of one provider call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("unsupported provider: {0}")]
    UnknownProvider(String),

    #[error("{0}")]
    Provider(String),

    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("executor crashed (exit: {exit})")]
    Crashed { exit: String },
}

impl ExecutorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// How a single adapter call is run
#[async_trait]
pub trait CallIsolation: Send + Sync {
    async fn call(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<Generation, ExecutorError>;
}

/// Direct call on the current task. No crash protection.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineCall;

#[async_trait]
impl CallIsolation for InlineCall {
    async fn call(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<Generation, ExecutorError> {
        match tokio::time::timeout(timeout, adapter.generate(request)).await {
            Ok(result) => result.map_err(provider_error),
            Err(_) => Err(timeout_error(timeout)),
        }
    }
}

/// Call on a dedicated, abortable task
#[derive(Debug, Default, Clone, Copy)]
pub struct IsolatedCall;

#[async_trait]
impl CallIsolation for IsolatedCall {
    async fn call(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<Generation, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let result = adapter.generate(request).await;
            let _ = tx.send(result);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map_err(provider_error),
            Ok(Err(_)) => {
                let exit = exit_reason(handle.await);
                error!(exit = %exit, "Provider task ended without a result");
                Err(ExecutorError::Crashed { exit })
            }
            Err(_) => {
                handle.abort();
                Err(timeout_error(timeout))
            }
        }
    }
}

/// Runs generation calls against registered adapters
#[derive(Clone)]
pub struct ProviderExecutor {
    registry: Arc<ProviderRegistry>,
    isolation: Arc<dyn CallIsolation>,
    timeout: Duration,
}

impl ProviderExecutor {
    pub fn new(registry: Arc<ProviderRegistry>, mode: ExecutionMode, timeout: Duration) -> Self {
        let isolation: Arc<dyn CallIsolation> = match mode {
            ExecutionMode::Inline => Arc::new(InlineCall),
            ExecutionMode::Isolated => Arc::new(IsolatedCall),
        };
        Self::with_isolation(registry, isolation, timeout)
    }

    pub fn with_isolation(
        registry: Arc<ProviderRegistry>,
        isolation: Arc<dyn CallIsolation>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            isolation,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One call, never retried
    pub async fn generate(
        &self,
        provider: &str,
        request: GenerationRequest,
    ) -> Result<Generation, ExecutorError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| ExecutorError::UnknownProvider(provider.to_string()))?;

        debug!(provider = %provider, model = %request.model, "Calling provider");

        let result = self.isolation.call(adapter, request, self.timeout).await;
        if let Err(e) = &result {
            warn!(provider = %provider, error = %e, "Provider call failed");
        }
        result
    }
}

fn provider_error(e: anyhow::Error) -> ExecutorError {
    ExecutorError::Provider(format!("{:#}", e))
}

fn timeout_error(timeout: Duration) -> ExecutorError {
    ExecutorError::Timeout {
        seconds: timeout.as_secs(),
    }
}

fn exit_reason(joined: Result<(), JoinError>) -> String {
    match joined {
        Ok(()) => "no result delivered".to_string(),
        Err(e) if e.is_panic() => format!("panic: {}", panic_message(e.into_panic())),
        Err(e) if e.is_cancelled() => "cancelled".to_string(),
        Err(e) => e.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    enum Behavior {
        Reply(&'static str),
        Fail(&'static str),
        Hang,
        Panic,
    }

    struct Scripted {
        behavior: Behavior,
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _request: GenerationRequest) -> anyhow::Result<Generation> {
            match self.behavior {
                Behavior::Reply(text) => Ok(Generation::text(text)),
                Behavior::Fail(message) => bail!("{}", message),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Generation::default())
                }
                Behavior::Panic => panic!("adapter blew up"),
            }
        }
    }

    fn executor(behavior: Behavior, mode: ExecutionMode) -> ProviderExecutor {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Scripted { behavior }));
        ProviderExecutor::new(Arc::new(registry), mode, DEFAULT_PROVIDER_TIMEOUT)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("m", "be brief", "hello")
    }

    #[tokio::test]
    async fn test_reply_in_both_modes() {
        for mode in [ExecutionMode::Inline, ExecutionMode::Isolated] {
            let generation = executor(Behavior::Reply("hi"), mode)
                .generate("scripted", request())
                .await
                .unwrap();
            assert_eq!(generation.text, "hi");
        }
    }

    #[tokio::test]
    async fn test_provider_error_passes_through() {
        let err = executor(Behavior::Fail("bad key"), ExecutionMode::Isolated)
            .generate("scripted", request())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Provider("bad key".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_in_both_modes() {
        for mode in [ExecutionMode::Inline, ExecutionMode::Isolated] {
            let err = executor(Behavior::Hang, mode)
                .generate("scripted", request())
                .await
                .unwrap_err();
            assert!(err.is_timeout());
            assert!(err.to_string().contains("timeout after 45s"));
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained_as_crash() {
        let err = executor(Behavior::Panic, ExecutionMode::Isolated)
            .generate("scripted", request())
            .await
            .unwrap_err();
        match err {
            ExecutorError::Crashed { exit } => assert!(exit.contains("adapter blew up")),
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let err = executor(Behavior::Reply("x"), ExecutionMode::Inline)
            .generate("mistral", request())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::UnknownProvider("mistral".to_string()));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(ExecutionMode::parse("INLINE"), Some(ExecutionMode::Inline));
        assert_eq!(ExecutionMode::parse("isolated"), Some(ExecutionMode::Isolated));
        assert_eq!(ExecutionMode::parse("thread"), None);
        assert_eq!(ExecutionMode::default(), ExecutionMode::Isolated);
    }
}
