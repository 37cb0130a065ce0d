//! Append-only event log with file-based persistence.
//!
//! Each run has its own log at `<base>/<run_id>/events.jsonl`: one JSON event
//! per line, appended with a single write. A stored event's cursor is its
//! 1-based line number. Readers only consume newline-terminated lines, so a
//! write in flight is never observed half-done.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::{Event, EventType, StoredEvent};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// File-based event store using JSONL format
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Directory holding one subdirectory per run
    base_dir: PathBuf,

    /// How often subscriptions re-read the log when caught up
    poll_interval: Duration,
}

impl EventStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to a run's events file
    pub fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.base_dir.join(run_id.to_string()).join("events.jsonl")
    }

    /// Append an event to a run's log
    pub async fn append(&self, run_id: Uuid, event: &Event) -> Result<()> {
        let path = self.events_path(run_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Append a typed event. `run_id` is always present in the payload.
    pub async fn publish(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        payload.insert(
            "run_id".to_string(),
            serde_json::Value::String(run_id.to_string()),
        );

        self.append(run_id, &Event::new(event_type, serde_json::Value::Object(payload)))
            .await
    }

    /// Replay all events in order
    pub async fn replay(&self, run_id: Uuid) -> Result<Vec<StoredEvent>> {
        self.read_after(run_id, 0).await
    }

    /// Events with a cursor strictly greater than `cursor`
    pub async fn read_after(&self, run_id: Uuid, cursor: u64) -> Result<Vec<StoredEvent>> {
        let path = self.events_path(run_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read events file: {}", path.display()))
            }
        };

        parse_complete_lines(&bytes, cursor)
    }

    /// Append the synthetic `ready` marker if the log has no events yet.
    ///
    /// Safe to call from several consumers at once: the check and the
    /// append happen under an exclusive file lock.
    pub async fn ensure_ready(&self, run_id: Uuid) -> Result<()> {
        let path = self.events_path(run_id);
        tokio::task::spawn_blocking(move || append_ready_if_empty(&path))
            .await
            .context("ready marker task failed")?
    }

    /// Attach a consumer that resumes after `after` (0 = from the beginning)
    pub async fn subscribe(&self, run_id: Uuid, after: u64) -> Result<EventSubscription> {
        self.ensure_ready(run_id).await?;
        Ok(EventSubscription {
            store: self.clone(),
            run_id,
            cursor: after,
            pending: VecDeque::new(),
        })
    }

    /// List all run IDs that have a log directory
    pub async fn list_runs(&self) -> Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(uuid) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| Uuid::parse_str(name).ok())
                {
                    runs.push(uuid);
                }
            }
        }

        Ok(runs)
    }
}

fn parse_complete_lines(bytes: &[u8], after: u64) -> Result<Vec<StoredEvent>> {
    let mut events = Vec::new();
    let mut cursor = 0u64;
    let mut rest = bytes;

    while let Some(end) = rest.iter().position(|b| *b == b'\n') {
        let line = &rest[..end];
        rest = &rest[end + 1..];
        cursor += 1;

        if cursor <= after || line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let event: Event = serde_json::from_slice(line).with_context(|| {
            format!(
                "Failed to parse event at cursor {}: {}",
                cursor,
                String::from_utf8_lossy(line)
            )
        })?;
        events.push(StoredEvent { cursor, event });
    }

    Ok(events)
}

fn append_ready_if_empty(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("Failed to lock events file: {}", path.display()))?;

    let result: Result<()> = (|| {
        let mut existing = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut existing)?;
        if existing.contains(&b'\n') {
            return Ok(());
        }

        let json = serde_json::to_string(&Event::ready()).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())?;
        file.flush()?;
        Ok(())
    })();

    let _ = FileExt::unlock(&file);
    result
}

/// A resumable reader over one run's log.
///
/// Delivery is at-least-once: a consumer that reconnects with the last cursor
/// it saw continues right after it.
#[derive(Debug)]
pub struct EventSubscription {
    store: EventStore,
    run_id: Uuid,
    cursor: u64,
    pending: VecDeque<StoredEvent>,
}

impl EventSubscription {
    /// Cursor of the last delivered event
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Wait for the next event
    pub async fn next(&mut self) -> Result<StoredEvent> {
        loop {
            if let Some(next) = self.try_next().await? {
                return Ok(next);
            }
            tokio::time::sleep(self.store.poll_interval).await;
        }
    }

    /// Next event if one is already in the log
    pub async fn try_next(&mut self) -> Result<Option<StoredEvent>> {
        if self.pending.is_empty() {
            let fresh = self.store.read_after(self.run_id, self.cursor).await?;
            self.pending.extend(fresh);
        }

        Ok(self.pending.pop_front().map(|event| {
            self.cursor = event.cursor;
            event
        }))
    }
}
