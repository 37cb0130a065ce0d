//! Progress events published for each run.
//!
//! Events form an append-only, totally ordered log per run. Each stored event
//! is addressed by a cursor: its 1-based position in the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Type tag (e.g. "artifact.created")
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Structured payload (NO secrets)
    pub payload: serde_json::Value,

    /// When this event was appended
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Synthetic marker appended when a consumer attaches to an empty log
    pub fn ready() -> Self {
        Self::new(EventType::Ready, serde_json::json!({}))
    }
}

/// An event read back from the log together with its cursor
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Position in the log (first event is 1)
    pub cursor: u64,
    pub event: Event,
}

impl StoredEvent {
    /// Frame for incremental delivery over a long-lived connection
    /// (Server-Sent Events layout)
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(&self.event.payload).unwrap_or_else(|_| "{}".into());
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.cursor,
            self.event.event_type.as_str(),
            data
        )
    }
}

/// Types of events emitted while executing a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Lazily appended so early subscribers see a stream
    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "run.started")]
    RunStarted,

    /// The run could not be executed (e.g. it does not exist)
    #[serde(rename = "run.error")]
    RunError,

    /// URLs in the query were fetched as reference context
    #[serde(rename = "run.context_fetched")]
    RunContextFetched,

    #[serde(rename = "artifact.planned")]
    ArtifactPlanned,

    #[serde(rename = "artifact.started")]
    ArtifactStarted,

    /// Incremental text from the first generation of a pass
    #[serde(rename = "artifact.chunk")]
    ArtifactChunk,

    /// Periodic streaming progress (every 10th chunk)
    #[serde(rename = "artifact.progress")]
    ArtifactProgress,

    #[serde(rename = "artifact.created")]
    ArtifactCreated,

    #[serde(rename = "artifact.error")]
    ArtifactError,

    #[serde(rename = "score.started")]
    ScoreStarted,

    #[serde(rename = "score.created")]
    ScoreCreated,

    #[serde(rename = "run.completed")]
    RunCompleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::RunStarted => "run.started",
            Self::RunError => "run.error",
            Self::RunContextFetched => "run.context_fetched",
            Self::ArtifactPlanned => "artifact.planned",
            Self::ArtifactStarted => "artifact.started",
            Self::ArtifactChunk => "artifact.chunk",
            Self::ArtifactProgress => "artifact.progress",
            Self::ArtifactCreated => "artifact.created",
            Self::ArtifactError => "artifact.error",
            Self::ScoreStarted => "score.started",
            Self::ScoreCreated => "score.created",
            Self::RunCompleted => "run.completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            EventType::ArtifactCreated,
            serde_json::json!({ "pass_index": 1 }),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"artifact.created\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::ArtifactCreated);
        assert_eq!(parsed.payload["pass_index"], 1);
    }

    #[test]
    fn test_sse_frame() {
        let stored = StoredEvent {
            cursor: 7,
            event: Event::new(EventType::ScoreStarted, serde_json::json!({ "pass_index": 2 })),
        };

        assert_eq!(
            stored.to_sse_frame(),
            "id: 7\nevent: score.started\ndata: {\"pass_index\":2}\n\n"
        );
    }

    #[test]
    fn test_type_names_match_serde() {
        for event_type in [
            EventType::Ready,
            EventType::RunContextFetched,
            EventType::ArtifactProgress,
            EventType::RunCompleted,
        ] {
            let json = serde_json::to_value(event_type).unwrap();
            assert_eq!(json, event_type.as_str());
        }
    }
}
