//! Run orchestrator: the three-pass refinement state machine.
//!
//! Passes run strictly in slot order (a, b, c); a slot without a model is
//! skipped. Each pass goes PLANNED → STARTED → COMPLETED | ERRORED and a
//! failed pass never stops the next one, storage errors inside a pass
//! included. The run always ends `completed`; the only early exits are a run
//! id that doesn't resolve and a run that was already picked up.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{GenerationRequest, ProviderRegistry};
use crate::config::Settings;
use crate::context::{ContextSource, NoContext, WebContextAugmenter};
use crate::domain::{
    Artifact, CredentialMode, EventType, ModelRef, PassRole, Run, RunStatus, Score, Slot,
    UsageCounters,
};
use crate::store::{RunStore, SqliteStore};
use crate::tools::{ToolExecutor, ToolRegistry};

use super::credentials::CredentialResolver;
use super::event_store::EventStore;
use super::executor::ProviderExecutor;
use super::prompt::build_pass_prompt;
use super::scoring::QualityScorer;
use super::session::{SessionRequest, ToolSession};

/// A progress event is published every this many chunks
pub const PROGRESS_EVERY: u64 = 10;

const JUDGE_PROVIDER: &str = "xai";

#[derive(Debug, Error)]
#[error("run not found: {0}")]
pub struct RunNotFound(pub Uuid);

/// Final state of an executed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub artifacts: Vec<Artifact>,
    pub scores: Vec<Score>,
    pub total_usage: UsageCounters,
}

impl RunReport {
    pub fn failed_passes(&self) -> usize {
        self.artifacts.iter().filter(|a| a.is_failed()).count()
    }
}

/// Main run orchestrator
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    events: EventStore,
    credentials: CredentialResolver,
    session: ToolSession,
    scorer: QualityScorer,
    context: Arc<dyn ContextSource>,
}

impl Orchestrator {
    /// Orchestrator with no context augmentation and heuristic scoring
    pub fn new(
        store: Arc<dyn RunStore>,
        events: EventStore,
        credentials: CredentialResolver,
        executor: Arc<ProviderExecutor>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            store,
            events,
            credentials,
            session: ToolSession::new(executor, tools),
            scorer: QualityScorer::heuristic_only(),
            context: Arc::new(NoContext),
        }
    }

    pub fn with_scorer(mut self, scorer: QualityScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_context_source(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = context;
        self
    }

    /// Wire up the production collaborators
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn RunStore> = Arc::new(
            SqliteStore::open(&settings.database)
                .with_context(|| format!("Failed to open {}", settings.database.display()))?,
        );

        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        let registry = Arc::new(ProviderRegistry::with_defaults(client.clone()));
        let executor = Arc::new(ProviderExecutor::new(
            registry.clone(),
            settings.execution_mode,
            settings.provider_timeout,
        ));
        let tools = Arc::new(ToolRegistry::with_defaults(client)?);

        let credentials = CredentialResolver::new(
            store.clone(),
            settings.secret_store().ok(),
            settings.managed_keys.clone(),
        );

        let scorer = match (
            registry.get(JUDGE_PROVIDER),
            settings.managed_keys.get(JUDGE_PROVIDER),
        ) {
            (Some(adapter), Some(key)) => {
                QualityScorer::with_judge(adapter, key, settings.judge_model.clone())
                    .with_timeout(settings.provider_timeout)
            }
            _ => {
                info!("No judge key configured; scores will use the heuristic");
                QualityScorer::heuristic_only()
            }
        };

        Ok(Self::new(
            store,
            EventStore::new(settings.runs_dir()),
            credentials,
            executor,
            tools,
        )
        .with_scorer(scorer)
        .with_context_source(Arc::new(WebContextAugmenter::new()?)))
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.store.clone()
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Execute every assigned pass of a run.
    ///
    /// Returns [`RunNotFound`] (after publishing `run.error`) when the id
    /// doesn't resolve. Pass failures are recorded on their artifacts. A run
    /// that is already running or completed is not executed again; its
    /// stored state is reported instead.
    #[instrument(skip(self, credential_modes), fields(run_id = %run_id))]
    pub async fn execute_run(
        &self,
        run_id: Uuid,
        credential_modes: &HashMap<String, CredentialMode>,
    ) -> Result<RunReport> {
        let Some(mut run) = self.store.get_run(run_id)? else {
            warn!("Run not found");
            self.emit(run_id, EventType::RunError, json!({ "error": "run not found" }))
                .await;
            return Err(RunNotFound(run_id).into());
        };

        if !run.advance(RunStatus::Running) {
            info!(status = run.status.as_str(), "Run already picked up, not executing again");
            return Ok(RunReport {
                run_id,
                status: run.status,
                artifacts: self.store.list_artifacts(run_id)?,
                scores: self.store.list_scores(run_id)?,
                total_usage: run.total_usage,
            });
        }
        self.store
            .mark_run_running(run_id, run.started_at.unwrap_or_else(Utc::now))?;

        info!(query_chars = run.query.chars().count(), "Starting run");
        self.emit(run_id, EventType::RunStarted, json!({})).await;

        let augmented_query = self.augment(&run).await;

        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut draft: Option<Artifact> = None;
        let mut refined: Option<Artifact> = None;

        for slot in Slot::ALL {
            let Some(model_ref) = run.model_for(slot) else {
                debug!(slot = slot.as_str(), "Slot unassigned, skipping");
                continue;
            };

            let prior = match slot.role() {
                PassRole::Draft => None,
                PassRole::Refine => draft.as_ref(),
                PassRole::Synthesis => refined.as_ref(),
            };

            let artifact = self
                .execute_pass(&run, slot, model_ref, &augmented_query, prior, credential_modes)
                .await;

            match slot.role() {
                PassRole::Draft => draft = Some(artifact.clone()),
                PassRole::Refine => refined = Some(artifact.clone()),
                PassRole::Synthesis => {}
            }
            artifacts.push(artifact);
        }

        let mut total_usage = UsageCounters::new();
        for artifact in &artifacts {
            total_usage.merge(&artifact.usage);
        }

        run.advance(RunStatus::Completed);
        self.store.mark_run_completed(
            run_id,
            run.ended_at.unwrap_or_else(Utc::now),
            &total_usage,
        )?;
        self.emit(run_id, EventType::RunCompleted, json!({})).await;

        let scores = self.store.list_scores(run_id).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load scores");
            Vec::new()
        });
        let report = RunReport {
            run_id,
            status: RunStatus::Completed,
            scores,
            artifacts,
            total_usage,
        };
        info!(
            passes = report.artifacts.len(),
            failed = report.failed_passes(),
            "Run completed"
        );
        Ok(report)
    }

    /// Query with fetched reference context, or the raw query on failure
    async fn augment(&self, run: &Run) -> String {
        match self.context.augment(&run.query).await {
            Ok(augmented) => {
                if !augmented.sources.is_empty() {
                    info!(sources = augmented.sources.len(), "Fetched reference context");
                    self.emit(
                        run.id,
                        EventType::RunContextFetched,
                        json!({ "sources": augmented.sources }),
                    )
                    .await;
                }
                augmented.text
            }
            Err(e) => {
                warn!(error = %e, "Context augmentation failed, using raw query");
                run.query.clone()
            }
        }
    }

    /// Run one pass to a terminal state.
    ///
    /// Storage errors are recorded on the artifact like any other failure.
    async fn execute_pass(
        &self,
        run: &Run,
        slot: Slot,
        raw_model_ref: &str,
        augmented_query: &str,
        prior: Option<&Artifact>,
        credential_modes: &HashMap<String, CredentialMode>,
    ) -> Artifact {
        let pass_index = slot.pass_index();

        let model_ref = match ModelRef::parse(raw_model_ref) {
            Ok(model_ref) => model_ref,
            Err(e) => {
                self.emit(
                    run.id,
                    EventType::ArtifactPlanned,
                    json!({
                        "pass_index": pass_index,
                        "slot": slot.as_str(),
                        "provider": null,
                        "model": null,
                    }),
                )
                .await;
                let artifact = Artifact::planned(run.id, slot, raw_model_ref);
                return self.record_failed(artifact, e.to_string()).await;
            }
        };

        let requested = credential_modes.get(&model_ref.provider).copied();
        let credential = match self.credentials.resolve(&model_ref.provider, requested) {
            Ok(credential) => credential,
            Err(e) => {
                self.emit(
                    run.id,
                    EventType::ArtifactPlanned,
                    json!({
                        "pass_index": pass_index,
                        "slot": slot.as_str(),
                        "provider": model_ref.provider,
                        "model": model_ref.model,
                    }),
                )
                .await;
                let artifact = Artifact::planned(run.id, slot, model_ref.to_string());
                let error = format!("Credential lookup failed: {:#}", e);
                return self.record_failed(artifact, error).await;
            }
        };

        self.emit(
            run.id,
            EventType::ArtifactPlanned,
            json!({
                "pass_index": pass_index,
                "slot": slot.as_str(),
                "provider": model_ref.provider,
                "model": model_ref.model,
                "credential_mode": credential.mode.as_str(),
            }),
        )
        .await;

        let prior_output = prior.and_then(Artifact::usable_output);
        let mut artifact = Artifact::planned(run.id, slot, model_ref.to_string());
        if let Some(prior) = prior.filter(|p| p.usable_output().is_some()) {
            artifact = artifact.with_prior(prior.id);
        }
        if let Err(e) = self.store.insert_artifact(&artifact) {
            return self
                .fail(artifact, format!("Failed to record artifact: {:#}", e), None)
                .await;
        }

        let Some(api_key) = credential.secret.clone() else {
            let error = format!(
                "No API key available for provider={} (mode={})",
                model_ref.provider, credential.mode
            );
            return self.fail(artifact, error, None).await;
        };

        self.emit(
            run.id,
            EventType::ArtifactStarted,
            json!({
                "artifact_id": artifact.id,
                "pass_index": pass_index,
                "model_id": artifact.model_id,
            }),
        )
        .await;

        let prompt = build_pass_prompt(run, slot, augmented_query, prior_output);
        let generation = GenerationRequest::new(&model_ref.model, prompt.instructions, prompt.input)
            .with_api_key(api_key)
            .with_max_output_tokens(run.output_length.max_output_tokens());

        let (tx, rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let (result, chunks) = tokio::join!(
            self.session.run(SessionRequest {
                provider: model_ref.provider.clone(),
                generation,
                stream: Some(tx),
            }),
            self.forward_chunks(run.id, artifact.id, pass_index, rx),
        );
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(artifact, e.to_string(), Some(latency_ms)).await,
        };

        debug!(
            pass_index,
            iterations = outcome.iterations,
            tools = outcome.tool_invocations.len(),
            chunks,
            "Pass generated"
        );

        if let Err(e) =
            self.store
                .complete_artifact(artifact.id, &outcome.text, &outcome.usage, latency_ms)
        {
            let error = format!("Failed to record output: {:#}", e);
            return self.fail(artifact, error, Some(latency_ms)).await;
        }
        artifact.output_text = outcome.text;
        artifact.usage = outcome.usage;
        artifact.latency_ms = Some(latency_ms);

        self.emit(
            run.id,
            EventType::ArtifactCreated,
            json!({
                "artifact_id": artifact.id,
                "pass_index": pass_index,
                "model_id": artifact.model_id,
                "latency_ms": latency_ms,
                "credential_mode": credential.mode.as_str(),
                "output_tokens": artifact.usage.first_of(&["output_tokens", "completion_tokens", "candidatesTokenCount"]),
                "input_tokens": artifact.usage.first_of(&["input_tokens", "prompt_tokens", "promptTokenCount"]),
            }),
        )
        .await;

        self.score(run, &artifact).await;
        artifact
    }

    /// Scoring never fails the pass; a score that can't be stored is logged
    async fn score(&self, run: &Run, artifact: &Artifact) {
        self.emit(
            run.id,
            EventType::ScoreStarted,
            json!({ "artifact_id": artifact.id, "pass_index": artifact.pass_index }),
        )
        .await;

        let result = self.scorer.score(&run.instructions, &artifact.output_text).await;
        let score = Score::new(run.id, artifact.id, &result);
        if let Err(e) = self.store.insert_score(&score) {
            warn!(pass_index = artifact.pass_index, error = %e, "Failed to store score");
            return;
        }

        self.emit(
            run.id,
            EventType::ScoreCreated,
            json!({
                "artifact_id": artifact.id,
                "pass_index": artifact.pass_index,
                "total": score.total,
                "data": score.data,
            }),
        )
        .await;
    }

    /// Insert an artifact that failed before it could start
    async fn record_failed(&self, artifact: Artifact, error: String) -> Artifact {
        if let Err(e) = self.store.insert_artifact(&artifact) {
            warn!(pass_index = artifact.pass_index, error = %e, "Failed to record artifact");
        }
        self.fail(artifact, error, None).await
    }

    /// Record a pass failure on the artifact and publish it
    async fn fail(&self, mut artifact: Artifact, error: String, latency_ms: Option<u64>) -> Artifact {
        warn!(pass_index = artifact.pass_index, error = %error, "Pass failed");
        if let Err(e) = self.store.fail_artifact(artifact.id, &error, latency_ms) {
            warn!(pass_index = artifact.pass_index, error = %e, "Failed to record pass failure");
        }

        self.emit(
            artifact.run_id,
            EventType::ArtifactError,
            json!({
                "artifact_id": artifact.id,
                "pass_index": artifact.pass_index,
                "error": error,
            }),
        )
        .await;

        artifact.error = Some(error);
        artifact.latency_ms = latency_ms;
        artifact
    }

    /// Publish streamed chunks until the sender side is dropped
    async fn forward_chunks(
        &self,
        run_id: Uuid,
        artifact_id: Uuid,
        pass_index: u8,
        mut chunks: mpsc::UnboundedReceiver<String>,
    ) -> u64 {
        let mut received = 0u64;
        let mut chars = 0usize;

        while let Some(chunk) = chunks.recv().await {
            received += 1;
            chars += chunk.chars().count();

            self.emit(
                run_id,
                EventType::ArtifactChunk,
                json!({
                    "artifact_id": artifact_id,
                    "pass_index": pass_index,
                    "chunk": chunk,
                }),
            )
            .await;

            if received % PROGRESS_EVERY == 0 {
                self.emit(
                    run_id,
                    EventType::ArtifactProgress,
                    json!({
                        "artifact_id": artifact_id,
                        "pass_index": pass_index,
                        "chunks_received": received,
                        "approx_tokens": chars / 4,
                    }),
                )
                .await;
            }
        }
        received
    }

    /// Event log failures don't fail the run
    async fn emit(&self, run_id: Uuid, event_type: EventType, payload: serde_json::Value) {
        if let Err(e) = self.events.publish(run_id, event_type, payload).await {
            warn!(
                run_id = %run_id,
                event = event_type.as_str(),
                error = %e,
                "Failed to publish event"
            );
        }
    }
}
