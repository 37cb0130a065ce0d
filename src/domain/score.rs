//! Quality scores attached to successful artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dimension weights for the judge total
pub const WEIGHT_ALIGNMENT: f64 = 0.35;
pub const WEIGHT_ACCURACY: f64 = 0.35;
pub const WEIGHT_QUALITY: f64 = 0.2;
pub const WEIGHT_COMPLETENESS: f64 = 0.1;

/// Clamp into [0, 1]
pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// How a score was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    /// LLM judge returned parseable dimensions
    Judge,

    /// Judge unavailable or unparseable
    Heuristic,

    /// Output was empty, nothing to judge
    Empty,
}

/// The four scoring dimensions, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreDimensions {
    pub alignment: f64,
    pub completeness: f64,
    pub quality: f64,

    /// Undefined under the heuristic
    pub accuracy: Option<f64>,
}

impl ScoreDimensions {
    /// Weighted judge total, clamped into [0, 1]
    pub fn weighted_total(&self) -> f64 {
        clamp01(
            WEIGHT_ALIGNMENT * self.alignment
                + WEIGHT_ACCURACY * self.accuracy.unwrap_or(0.0)
                + WEIGHT_QUALITY * self.quality
                + WEIGHT_COMPLETENESS * self.completeness,
        )
    }
}

/// Result of scoring one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub method: ScoreMethod,
    pub dimensions: Option<ScoreDimensions>,
    pub notes: Vec<String>,
    pub words: usize,
    pub total: f64,
}

impl ScoreResult {
    pub fn empty() -> Self {
        Self {
            method: ScoreMethod::Empty,
            dimensions: None,
            notes: vec!["empty output".to_string()],
            words: 0,
            total: 0.0,
        }
    }

    /// Payload stored with the score and published on `score.created`
    pub fn data(&self) -> serde_json::Value {
        serde_json::json!({
            "method": self.method,
            "dimensions": self.dimensions,
            "notes": self.notes,
            "meta": { "words": self.words },
        })
    }
}

/// Persisted score for one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub id: Uuid,
    pub run_id: Uuid,
    pub artifact_id: Uuid,
    pub data: serde_json::Value,
    pub total: f64,
    pub created_at: DateTime<Utc>,
}

impl Score {
    pub fn new(run_id: Uuid, artifact_id: Uuid, result: &ScoreResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            artifact_id,
            data: result.data(),
            total: clamp01(result.total),
            created_at: Utc::now(),
        }
    }
}
