//! Artifacts produced by pipeline passes.
//!
//! One artifact is recorded per pass execution attempt. It is written before
//! the provider is called and updated exactly once with either the output or
//! the error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{PassRole, Slot};
use super::usage::UsageCounters;

/// The output record of one pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,

    /// Run this artifact belongs to
    pub run_id: Uuid,

    /// 1-based pass index (matches slot order a, b, c)
    pub pass_index: u8,

    pub role: PassRole,

    /// "provider:model" that produced (or was meant to produce) the output
    pub model_id: String,

    /// Slot and upstream references
    pub input_refs: serde_json::Value,

    /// Final text of the pass (empty until completion)
    pub output_text: String,

    /// Usage summed across all tool iterations
    pub usage: UsageCounters,

    /// Wall-clock time of the pass in milliseconds
    pub latency_ms: Option<u64>,

    /// Error message if the pass failed
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create the pre-execution record for a slot
    pub fn planned(run_id: Uuid, slot: Slot, model_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            pass_index: slot.pass_index(),
            role: slot.role(),
            model_id: model_id.into(),
            input_refs: serde_json::json!({ "slot": slot.as_str() }),
            output_text: String::new(),
            usage: UsageCounters::new(),
            latency_ms: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Record the artifact this pass builds on
    pub fn with_prior(mut self, prior: Uuid) -> Self {
        if let Some(refs) = self.input_refs.as_object_mut() {
            refs.insert(
                "prior_artifact_id".to_string(),
                serde_json::Value::String(prior.to_string()),
            );
        }
        self
    }

    /// Output usable as input for the next pass: no error and non-empty text
    pub fn usable_output(&self) -> Option<&str> {
        if self.error.is_some() || self.output_text.trim().is_empty() {
            None
        } else {
            Some(&self.output_text)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planned_artifact() {
        let run_id = Uuid::new_v4();
        let artifact = Artifact::planned(run_id, Slot::B, "anthropic:claude-sonnet-4");

        assert_eq!(artifact.pass_index, 2);
        assert_eq!(artifact.role, PassRole::Refine);
        assert_eq!(artifact.input_refs["slot"], "b");
        assert!(artifact.usable_output().is_none());
    }

    #[test]
    fn test_usable_output_requires_success() {
        let mut artifact = Artifact::planned(Uuid::new_v4(), Slot::A, "openai:gpt-4o");
        artifact.output_text = "draft".to_string();
        assert_eq!(artifact.usable_output(), Some("draft"));

        artifact.error = Some("timeout after 45s".to_string());
        assert!(artifact.usable_output().is_none());
    }

    #[test]
    fn test_with_prior() {
        let prior = Uuid::new_v4();
        let artifact = Artifact::planned(Uuid::new_v4(), Slot::C, "xai:grok-3").with_prior(prior);
        assert_eq!(artifact.input_refs["prior_artifact_id"], prior.to_string());
    }
}
