//! Run execution engine.
//!
//! This module contains:
//! - EventStore: per-run append-only progress log
//! - CredentialResolver: BYOK / managed key selection
//! - ProviderExecutor: timed, crash-contained provider calls
//! - ToolSession: bounded tool-calling loop
//! - QualityScorer: judge-based scoring with heuristic fallback
//! - Orchestrator: the three-pass state machine

pub mod credentials;
pub mod event_store;
pub mod executor;
pub mod orchestrator;
pub mod prompt;
pub mod scoring;
pub mod session;

// Re-export commonly used types
pub use credentials::CredentialResolver;
pub use event_store::{EventStore, EventSubscription};
pub use executor::{
    CallIsolation, ExecutionMode, ExecutorError, InlineCall, IsolatedCall, ProviderExecutor,
    DEFAULT_PROVIDER_TIMEOUT,
};
pub use orchestrator::{Orchestrator, RunNotFound, RunReport};
pub use prompt::{build_pass_prompt, PassPrompt};
pub use scoring::QualityScorer;
pub use session::{SessionOutcome, SessionRequest, ToolSession, MAX_TOOL_ITERATIONS};
