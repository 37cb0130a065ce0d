//! Domain types for the refinement worker.
//!
//! This module contains the core data structures:
//! - Run: one execution of the three-pass pipeline
//! - Artifact: the record of one pass
//! - Score: quality score of a successful artifact
//! - Events: progress log entries
//! - Credentials and usage counters

pub mod artifact;
pub mod credential;
pub mod events;
pub mod run;
pub mod score;
pub mod usage;

// Re-export commonly used types
pub use artifact::Artifact;
pub use credential::{CredentialMode, ProviderKey, ResolvedCredential};
pub use events::{Event, EventType, StoredEvent};
pub use run::{
    InvalidModelRef, ModelRef, OutputLength, PassRole, Run, RunStatus, Slot, DEFAULT_INSTRUCTIONS,
};
pub use score::{clamp01, Score, ScoreDimensions, ScoreMethod, ScoreResult};
pub use usage::UsageCounters;
