//! Background worker: claims queued jobs and executes their runs.
//!
//! Each claimed job runs on its own task. A semaphore bounds how many runs
//! execute at once; runs share nothing in memory.

pub mod queue;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::core::{Orchestrator, RunNotFound, RunReport};

pub use queue::{Job, JobQueue, JobSpec, JobStatus, QueueError, QueueStatus};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What happened to a claimed job
#[derive(Debug)]
pub enum JobOutcome {
    /// The run executed (individual passes may still have failed)
    Completed(RunReport),

    /// The job's run id wasn't a UUID
    Dropped,

    /// The run id didn't resolve to a stored run
    RunMissing,

    Failed(String),
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    queue: JobQueue,
    slots: Arc<Semaphore>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>, queue: JobQueue, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            orchestrator,
            queue,
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and process one job on the current task. Returns `None` when
    /// the queue has nothing pending.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        process_job(&self.orchestrator, &self.queue, job)
            .await
            .map(Some)
    }

    /// Process jobs until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Process jobs until `shutdown` resolves, then wait for in-flight runs
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            concurrency = self.concurrency,
            queue = %self.queue.path().display(),
            "Worker started"
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.slots.clone().acquire_owned() => {
                    permit.context("Worker semaphore closed")?
                }
            };

            let job = match self.queue.claim_next().await {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    None
                }
            };

            let Some(job) = job else {
                drop(permit);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            let orchestrator = self.orchestrator.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = process_job(&orchestrator, &queue, job).await {
                    error!(error = %e, "Job bookkeeping failed");
                }
            });
        }

        info!("Shutting down; waiting for in-flight runs");
        let _drained = self
            .slots
            .acquire_many(self.concurrency as u32)
            .await
            .context("Worker semaphore closed")?;
        info!("Worker stopped");
        Ok(())
    }
}

/// Execute a claimed job and record its result in the queue
#[instrument(skip(orchestrator, queue, job), fields(job_id = %job.id))]
pub async fn process_job(
    orchestrator: &Orchestrator,
    queue: &JobQueue,
    job: Job,
) -> Result<JobOutcome> {
    let Some(run_id) = job.run_id() else {
        warn!(run_id = %job.spec.run_id, "Failing job with invalid run id");
        queue.mark_failed(job.id, "invalid run id").await?;
        return Ok(JobOutcome::Dropped);
    };

    match orchestrator
        .execute_run(run_id, &job.spec.credential_modes)
        .await
    {
        Ok(report) => {
            queue.mark_done(job.id).await?;
            Ok(JobOutcome::Completed(report))
        }
        Err(e) if e.is::<RunNotFound>() => {
            queue.mark_failed(job.id, &e.to_string()).await?;
            Ok(JobOutcome::RunMissing)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            error!(%run_id, error = %message, "Run execution failed");
            queue.mark_failed(job.id, &message).await?;
            Ok(JobOutcome::Failed(message))
        }
    }
}
