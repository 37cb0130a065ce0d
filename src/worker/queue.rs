//! JSONL job queue.
//!
//! Follows the EventStore pattern: append-only JSONL with state derived from
//! replay. Every state change is a new line. Writers hold an exclusive file
//! lock across replay-then-append, so two workers never claim the same job.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::CredentialMode;

/// Errors that can occur with the job queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition for job {id}: {from:?} → {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Queue task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

/// A line in the queue log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: Uuid,
    pub event_type: QueueEventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    Enqueued,
    Claimed,
    Completed,
    Failed,
}

/// Payload of an `enqueued` line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Kept as text; a malformed id is dropped by the worker
    pub run_id: String,

    #[serde(default)]
    pub credential_modes: HashMap<String, CredentialMode>,
}

/// A job with current state (derived from replay)
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    /// Line of the `enqueued` entry; claim order
    seq: usize,
}

impl Job {
    /// The run id, if it is a valid UUID
    pub fn run_id(&self) -> Option<Uuid> {
        Uuid::parse_str(self.spec.run_id.trim()).ok()
    }
}

/// Queue status summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.done + self.failed
    }
}

/// JSONL-based job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    queue_path: PathBuf,
}

impl JobQueue {
    pub fn new(queue_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_path: queue_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.queue_path
    }

    /// Add a job for `run_id`
    pub async fn enqueue(
        &self,
        run_id: &str,
        credential_modes: HashMap<String, CredentialMode>,
    ) -> Result<Job, QueueError> {
        let spec = JobSpec {
            run_id: run_id.to_string(),
            credential_modes,
        };
        let job_id = Uuid::new_v4();
        let data = serde_json::to_value(&spec)?;

        self.locked(move |log| {
            log.append(&QueueEvent {
                timestamp: Utc::now(),
                job_id,
                event_type: QueueEventType::Enqueued,
                data: Some(data),
            })?;
            log.jobs.remove(&job_id).ok_or(QueueError::NotFound(job_id))
        })
        .await
    }

    /// Claim the oldest pending job
    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        self.locked(|log| {
            let Some(id) = log
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::Pending)
                .min_by_key(|job| job.seq)
                .map(|job| job.id)
            else {
                return Ok(None);
            };

            log.append(&QueueEvent {
                timestamp: Utc::now(),
                job_id: id,
                event_type: QueueEventType::Claimed,
                data: None,
            })?;
            Ok(log.jobs.remove(&id))
        })
        .await
    }

    pub async fn mark_done(&self, id: Uuid) -> Result<(), QueueError> {
        self.finish(id, QueueEventType::Completed, JobStatus::Done, None)
            .await
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.finish(
            id,
            QueueEventType::Failed,
            JobStatus::Failed,
            Some(serde_json::json!({ "error": error })),
        )
        .await
    }

    async fn finish(
        &self,
        id: Uuid,
        event_type: QueueEventType,
        to: JobStatus,
        data: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.locked(move |log| {
            let job = log.jobs.get(&id).ok_or(QueueError::NotFound(id))?;
            if job.status != JobStatus::Claimed {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: job.status,
                    to,
                });
            }
            log.append(&QueueEvent {
                timestamp: Utc::now(),
                job_id: id,
                event_type,
                data,
            })
        })
        .await
    }

    /// Replay all events to build current state
    pub async fn replay(&self) -> Result<HashMap<Uuid, Job>, QueueError> {
        let bytes = match tokio::fs::read(&self.queue_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        replay_bytes(&bytes)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.replay().await?.remove(&id))
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut status = QueueStatus::default();
        for job in self.replay().await?.values() {
            match job.status {
                JobStatus::Pending => status.pending += 1,
                JobStatus::Claimed => status.claimed += 1,
                JobStatus::Done => status.done += 1,
                JobStatus::Failed => status.failed += 1,
            }
        }
        Ok(status)
    }

    /// Run `f` against the replayed log while holding the file lock
    async fn locked<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LockedLog) -> Result<T, QueueError> + Send + 'static,
    {
        let path = self.queue_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, QueueError> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            file.lock_exclusive()?;

            let result = LockedLog::load(file.try_clone()?).and_then(|mut log| f(&mut log));

            let _ = FileExt::unlock(&file);
            result
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
    }
}

/// The queue file plus its replayed state, valid while the lock is held
struct LockedLog {
    file: std::fs::File,
    jobs: HashMap<Uuid, Job>,
    lines: usize,
}

impl LockedLog {
    fn load(mut file: std::fs::File) -> Result<Self, QueueError> {
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;
        let lines = bytes.iter().filter(|b| **b == b'\n').count();
        Ok(Self {
            file,
            jobs: replay_bytes(&bytes)?,
            lines,
        })
    }

    fn append(&mut self, event: &QueueEvent) -> Result<(), QueueError> {
        let json = serde_json::to_string(event)?;
        self.file.write_all(format!("{}\n", json).as_bytes())?;
        self.file.flush()?;
        self.lines += 1;
        apply_event(&mut self.jobs, event.clone(), self.lines);
        Ok(())
    }
}

fn replay_bytes(bytes: &[u8]) -> Result<HashMap<Uuid, Job>, QueueError> {
    let mut jobs = HashMap::new();
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(end) => &bytes[..end],
        None => return Ok(jobs),
    };

    for (index, line) in complete.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let event: QueueEvent = serde_json::from_slice(line)?;
        apply_event(&mut jobs, event, index + 1);
    }
    Ok(jobs)
}

/// Apply a single event to the state
fn apply_event(jobs: &mut HashMap<Uuid, Job>, event: QueueEvent, seq: usize) {
    match event.event_type {
        QueueEventType::Enqueued => {
            let Some(spec) = event
                .data
                .and_then(|data| serde_json::from_value::<JobSpec>(data).ok())
            else {
                return;
            };
            jobs.entry(event.job_id).or_insert(Job {
                id: event.job_id,
                spec,
                status: JobStatus::Pending,
                enqueued_at: event.timestamp,
                claimed_at: None,
                finished_at: None,
                error: None,
                seq,
            });
        }
        QueueEventType::Claimed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Claimed;
                job.claimed_at = Some(event.timestamp);
            }
        }
        QueueEventType::Completed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Done;
                job.finished_at = Some(event.timestamp);
            }
        }
        QueueEventType::Failed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Failed;
                job.finished_at = Some(event.timestamp);
                job.error = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("error"))
                    .and_then(|e| e.as_str())
                    .map(str::to_string);
            }
        }
    }
}
