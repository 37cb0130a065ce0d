//! Run state and pass layout.
//!
//! A Run is one execution of the fixed three-pass refinement pipeline
//! (draft → refine → synthesis) for a single query.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::usage::UsageCounters;

/// Base instructions used when a run carries none
pub const DEFAULT_INSTRUCTIONS: &str = "You are a precise, professional assistant.";

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Current status (monotonic: queued → running → completed)
    pub status: RunStatus,

    /// The user's original query
    pub query: String,

    /// Base system instructions for every pass
    pub instructions: String,

    /// Model assignment per slot, as "provider:model"
    pub selected_models: BTreeMap<Slot, String>,

    /// Per-slot prompt addenda (appended, never replacing the template)
    pub stage_prompts: BTreeMap<Slot, String>,

    /// Output-length policy
    pub output_length: OutputLength,

    /// Resource budget as submitted (opaque to the engine)
    pub budget: serde_json::Value,

    /// Usage summed over all artifacts once the run completes
    pub total_usage: UsageCounters,

    /// Terminal run-level error (unused by the pass pipeline)
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new queued run for a query
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Queued,
            query: query.into(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            selected_models: BTreeMap::new(),
            stage_prompts: BTreeMap::new(),
            output_length: OutputLength::default(),
            budget: serde_json::Value::Object(Default::default()),
            total_usage: UsageCounters::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Assign a "provider:model" reference to a slot
    pub fn with_model(mut self, slot: Slot, model_ref: impl Into<String>) -> Self {
        self.selected_models.insert(slot, model_ref.into());
        self
    }

    pub fn with_stage_prompt(mut self, slot: Slot, prompt: impl Into<String>) -> Self {
        self.stage_prompts.insert(slot, prompt.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        let instructions = instructions.into();
        if !instructions.trim().is_empty() {
            self.instructions = instructions;
        }
        self
    }

    pub fn with_output_length(mut self, output_length: OutputLength) -> Self {
        self.output_length = output_length;
        self
    }

    /// Model reference for a slot, ignoring blank assignments
    pub fn model_for(&self, slot: Slot) -> Option<&str> {
        self.selected_models
            .get(&slot)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Stage addendum for a slot, ignoring blank entries
    pub fn stage_prompt_for(&self, slot: Slot) -> Option<&str> {
        self.stage_prompts
            .get(&slot)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Move the run forward. Returns false (and changes nothing) for a regression.
    pub fn advance(&mut self, next: RunStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            RunStatus::Running => self.started_at = Some(now),
            RunStatus::Completed => self.ended_at = Some(now),
            RunStatus::Queued => {}
        }
        self.status = next;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Submitted, waiting for a worker
    Queued,

    /// A worker is executing the passes
    Running,

    /// All passes were attempted (individual passes may have failed)
    Completed,
}

impl RunStatus {
    /// Status transitions are monotonic and never regress
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        next > self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three fixed pipeline slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
    C,
}

impl Slot {
    /// Slots in execution order
    pub const ALL: [Slot; 3] = [Slot::A, Slot::B, Slot::C];

    /// 1-based pass index
    pub fn pass_index(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
        }
    }

    pub fn role(self) -> PassRole {
        match self {
            Self::A => PassRole::Draft,
            Self::B => PassRole::Refine,
            Self::C => PassRole::Synthesis,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" => Some(Self::A),
            "b" => Some(Self::B),
            "c" => Some(Self::C),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a pass plays in the refinement chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassRole {
    /// Initial response to the query
    Draft,

    /// Improves the draft
    Refine,

    /// Validates the refined response and produces the final version
    Synthesis,
}

impl PassRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Refine => "refine",
            Self::Synthesis => "synthesis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "refine" => Some(Self::Refine),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }
}

/// Output-length policy for every pass of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLength {
    Brief,
    Standard,
    Comprehensive,
}

impl OutputLength {
    /// Parse leniently; anything unknown is `Standard`
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "brief" => Self::Brief,
            "comprehensive" => Self::Comprehensive,
            _ => Self::Standard,
        }
    }

    /// Qualitative hint appended to the instructions
    pub fn hint(self) -> &'static str {
        match self {
            Self::Brief => "Keep it brief: ~5–8 sentences. Prioritize the highest-signal points.",
            Self::Standard => {
                "Standard length: clear, complete, and structured without being exhaustive."
            }
            Self::Comprehensive => {
                "Comprehensive (bounded): aim for ~800–1200 words with clear headings and actionable detail."
            }
        }
    }

    /// Best-effort output token cap passed to providers
    pub fn max_output_tokens(self) -> u32 {
        match self {
            Self::Brief => 350,
            Self::Standard => 900,
            Self::Comprehensive => 1600,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Standard => "standard",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl Default for OutputLength {
    fn default() -> Self {
        Self::Standard
    }
}

/// A parsed "provider:model" reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    /// Lower-cased provider identifier (e.g. "openai")
    pub provider: String,

    /// Provider-specific model name, kept verbatim (may contain colons)
    pub model: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid model ref '{0}': expected \"provider:model\"")]
pub struct InvalidModelRef(pub String);

impl ModelRef {
    pub fn parse(raw: &str) -> Result<Self, InvalidModelRef> {
        let (provider, model) = raw
            .split_once(':')
            .ok_or_else(|| InvalidModelRef(raw.to_string()))?;
        let provider = provider.trim().to_ascii_lowercase();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return Err(InvalidModelRef(raw.to_string()));
        }
        Ok(Self {
            provider,
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}
