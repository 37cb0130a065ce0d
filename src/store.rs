//! Persistent storage for runs, artifacts, scores and provider keys.
//!
//! The engine talks to storage through the [`RunStore`] trait; [`SqliteStore`]
//! is the bundled implementation. Every operation is a short transaction:
//! there are no long-held locks, and writes are visible to the next read on
//! the same store.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{
    Artifact, OutputLength, PassRole, ProviderKey, Run, RunStatus, Score, Slot, UsageCounters,
};

/// Storage operations the engine relies on
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: &Run) -> Result<()>;
    fn get_run(&self, id: Uuid) -> Result<Option<Run>>;

    /// queued → running. A no-op for runs already past queued.
    fn mark_run_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Any status → completed. A no-op for completed runs.
    fn mark_run_completed(&self, id: Uuid, at: DateTime<Utc>, total_usage: &UsageCounters)
        -> Result<()>;

    fn insert_artifact(&self, artifact: &Artifact) -> Result<()>;
    fn complete_artifact(
        &self,
        id: Uuid,
        output_text: &str,
        usage: &UsageCounters,
        latency_ms: u64,
    ) -> Result<()>;
    fn fail_artifact(&self, id: Uuid, error: &str, latency_ms: Option<u64>) -> Result<()>;

    /// Artifacts of a run ordered by pass index
    fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>>;

    fn insert_score(&self, score: &Score) -> Result<()>;
    fn list_scores(&self, run_id: Uuid) -> Result<Vec<Score>>;

    /// Insert or replace the user's key for a provider
    fn upsert_provider_key(&self, key: &ProviderKey) -> Result<()>;
    fn provider_key(&self, provider: &str) -> Result<Option<ProviderKey>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id              TEXT PRIMARY KEY,
    status          TEXT NOT NULL,
    query           TEXT NOT NULL,
    instructions    TEXT NOT NULL,
    selected_models TEXT NOT NULL,
    stage_prompts   TEXT NOT NULL,
    output_length   TEXT NOT NULL,
    budget          TEXT NOT NULL,
    total_usage     TEXT NOT NULL,
    error           TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    ended_at        TEXT
);

CREATE TABLE IF NOT EXISTS artifacts (
    id          TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES runs(id),
    pass_index  INTEGER NOT NULL,
    role        TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    input_refs  TEXT NOT NULL,
    output_text TEXT NOT NULL,
    usage       TEXT NOT NULL,
    latency_ms  INTEGER,
    error       TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id, pass_index);

CREATE TABLE IF NOT EXISTS scores (
    id          TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES runs(id),
    artifact_id TEXT NOT NULL UNIQUE REFERENCES artifacts(id),
    data        TEXT NOT NULL,
    total       REAL NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provider_keys (
    id             TEXT PRIMARY KEY,
    scope          TEXT NOT NULL,
    scope_id       TEXT NOT NULL,
    provider       TEXT NOT NULL,
    enabled        INTEGER NOT NULL,
    key_ciphertext TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    UNIQUE (scope, scope_id, provider)
);
"#;

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// In-memory database (tests, one-shot tooling)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to apply database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))?;
        f(&conn)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column")
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {}", raw))?
        .with_timezone(&Utc))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid uuid: {}", raw))
}

/// Raw column values of a `runs` row, converted outside the rusqlite closure
struct RunRow {
    id: String,
    status: String,
    query: String,
    instructions: String,
    selected_models: String,
    stage_prompts: String,
    output_length: String,
    budget: String,
    total_usage: String,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            query: row.get(2)?,
            instructions: row.get(3)?,
            selected_models: row.get(4)?,
            stage_prompts: row.get(5)?,
            output_length: row.get(6)?,
            budget: row.get(7)?,
            total_usage: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            ended_at: row.get(12)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: parse_uuid(&self.id)?,
            status: RunStatus::parse(&self.status)
                .with_context(|| format!("Unknown run status: {}", self.status))?,
            query: self.query,
            instructions: self.instructions,
            selected_models: serde_json::from_str::<std::collections::BTreeMap<Slot, String>>(
                &self.selected_models,
            )
            .context("Invalid selected_models column")?,
            stage_prompts: serde_json::from_str(&self.stage_prompts)
                .context("Invalid stage_prompts column")?,
            output_length: OutputLength::parse_lossy(&self.output_length),
            budget: serde_json::from_str(&self.budget).context("Invalid budget column")?,
            total_usage: serde_json::from_str(&self.total_usage)
                .context("Invalid total_usage column")?,
            error: self.error,
            created_at: parse_time(&self.created_at)?,
            started_at: parse_opt_time(self.started_at)?,
            ended_at: parse_opt_time(self.ended_at)?,
        })
    }
}

struct ArtifactRow {
    id: String,
    run_id: String,
    pass_index: i64,
    role: String,
    model_id: String,
    input_refs: String,
    output_text: String,
    usage: String,
    latency_ms: Option<i64>,
    error: Option<String>,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            pass_index: row.get(2)?,
            role: row.get(3)?,
            model_id: row.get(4)?,
            input_refs: row.get(5)?,
            output_text: row.get(6)?,
            usage: row.get(7)?,
            latency_ms: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_artifact(self) -> Result<Artifact> {
        Ok(Artifact {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            pass_index: u8::try_from(self.pass_index).context("pass_index out of range")?,
            role: PassRole::parse(&self.role)
                .with_context(|| format!("Unknown pass role: {}", self.role))?,
            model_id: self.model_id,
            input_refs: serde_json::from_str(&self.input_refs)
                .context("Invalid input_refs column")?,
            output_text: self.output_text,
            usage: serde_json::from_str(&self.usage).context("Invalid usage column")?,
            latency_ms: self.latency_ms.map(|v| v.max(0) as u64),
            error: self.error,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

impl RunStore for SqliteStore {
    fn insert_run(&self, run: &Run) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, status, query, instructions, selected_models, stage_prompts,
                                   output_length, budget, total_usage, error, created_at,
                                   started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.id.to_string(),
                    run.status.as_str(),
                    run.query,
                    run.instructions,
                    to_json(&run.selected_models)?,
                    to_json(&run.stage_prompts)?,
                    run.output_length.as_str(),
                    to_json(&run.budget)?,
                    to_json(&run.total_usage)?,
                    run.error,
                    run.created_at.to_rfc3339(),
                    run.started_at.map(|t| t.to_rfc3339()),
                    run.ended_at.map(|t| t.to_rfc3339()),
                ],
            )
            .with_context(|| format!("Failed to insert run {}", run.id))?;
            Ok(())
        })
    }

    fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, status, query, instructions, selected_models, stage_prompts,
                        output_length, budget, total_usage, error, created_at, started_at, ended_at
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                RunRow::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to load run {}", id))
        })?;

        row.map(RunRow::into_run).transpose()
    }

    fn mark_run_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id.to_string(), at.to_rfc3339()],
            )
            .with_context(|| format!("Failed to mark run {} running", id))?;
            Ok(())
        })
    }

    fn mark_run_completed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        total_usage: &UsageCounters,
    ) -> Result<()> {
        let usage = to_json(total_usage)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET status = 'completed', ended_at = ?2, total_usage = ?3
                 WHERE id = ?1 AND status != 'completed'",
                params![id.to_string(), at.to_rfc3339(), usage],
            )
            .with_context(|| format!("Failed to mark run {} completed", id))?;
            Ok(())
        })
    }

    fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO artifacts (id, run_id, pass_index, role, model_id, input_refs,
                                        output_text, usage, latency_ms, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    artifact.id.to_string(),
                    artifact.run_id.to_string(),
                    artifact.pass_index as i64,
                    artifact.role.as_str(),
                    artifact.model_id,
                    to_json(&artifact.input_refs)?,
                    artifact.output_text,
                    to_json(&artifact.usage)?,
                    artifact.latency_ms.map(|v| v as i64),
                    artifact.error,
                    artifact.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert artifact {}", artifact.id))?;
            Ok(())
        })
    }

    fn complete_artifact(
        &self,
        id: Uuid,
        output_text: &str,
        usage: &UsageCounters,
        latency_ms: u64,
    ) -> Result<()> {
        let usage = to_json(usage)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET output_text = ?2, usage = ?3, latency_ms = ?4 WHERE id = ?1",
                params![id.to_string(), output_text, usage, latency_ms as i64],
            )
            .with_context(|| format!("Failed to complete artifact {}", id))?;
            Ok(())
        })
    }

    fn fail_artifact(&self, id: Uuid, error: &str, latency_ms: Option<u64>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET error = ?2, latency_ms = ?3 WHERE id = ?1",
                params![id.to_string(), error, latency_ms.map(|v| v as i64)],
            )
            .with_context(|| format!("Failed to record error on artifact {}", id))?;
            Ok(())
        })
    }

    fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, pass_index, role, model_id, input_refs, output_text, usage,
                        latency_ms, error, created_at
                 FROM artifacts WHERE run_id = ?1 ORDER BY pass_index, created_at",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string()], ArtifactRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("Failed to list artifacts for run {}", run_id))?;
            Ok(rows)
        })?;

        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }

    fn insert_score(&self, score: &Score) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scores (id, run_id, artifact_id, data, total, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    score.id.to_string(),
                    score.run_id.to_string(),
                    score.artifact_id.to_string(),
                    to_json(&score.data)?,
                    score.total,
                    score.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert score for artifact {}", score.artifact_id))?;
            Ok(())
        })
    }

    fn list_scores(&self, run_id: Uuid) -> Result<Vec<Score>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, artifact_id, data, total, created_at
                 FROM scores WHERE run_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("Failed to list scores for run {}", run_id))?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, run_id, artifact_id, data, total, created_at)| {
                Ok(Score {
                    id: parse_uuid(&id)?,
                    run_id: parse_uuid(&run_id)?,
                    artifact_id: parse_uuid(&artifact_id)?,
                    data: serde_json::from_str(&data).context("Invalid score data column")?,
                    total,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    fn upsert_provider_key(&self, key: &ProviderKey) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO provider_keys (id, scope, scope_id, provider, enabled,
                                            key_ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (scope, scope_id, provider) DO UPDATE SET
                     enabled = excluded.enabled,
                     key_ciphertext = excluded.key_ciphertext",
                params![
                    key.id.to_string(),
                    key.scope,
                    key.scope_id,
                    key.provider,
                    key.enabled,
                    key.key_ciphertext,
                    key.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to store key for provider {}", key.provider))?;
            Ok(())
        })
    }

    fn provider_key(&self, provider: &str) -> Result<Option<ProviderKey>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, scope, scope_id, provider, enabled, key_ciphertext, created_at
                 FROM provider_keys
                 WHERE provider = ?1 AND scope = ?2 AND scope_id = ?3",
                params![
                    provider,
                    ProviderKey::USER_SCOPE,
                    ProviderKey::LOCAL_SCOPE_ID
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("Failed to load key for provider {}", provider))
        })?;

        row.map(
            |(id, scope, scope_id, provider, enabled, key_ciphertext, created_at)| {
                Ok(ProviderKey {
                    id: parse_uuid(&id)?,
                    scope,
                    scope_id,
                    provider,
                    enabled,
                    key_ciphertext,
                    created_at: parse_time(&created_at)?,
                })
            },
        )
        .transpose()
    }
}
