//! Command-line interface for chriseon.
//!
//! Provides commands for submitting runs, running the worker, following a
//! run's event stream, inspecting results and managing stored provider keys.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::Settings;
use crate::core::{EventStore, Orchestrator};
use crate::domain::{CredentialMode, EventType, OutputLength, ProviderKey, Run, Slot};
use crate::store::{RunStore, SqliteStore};
use crate::worker::{JobOutcome, JobQueue, Worker};

/// chriseon - multi-pass AI refinement worker
#[derive(Parser, Debug)]
#[command(name = "chriseon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run and queue it for the worker
    Submit {
        /// The query to refine
        query: String,

        /// Draft model (provider:model)
        #[arg(long)]
        a: Option<String>,

        /// Refine model (provider:model)
        #[arg(long)]
        b: Option<String>,

        /// Synthesis model (provider:model)
        #[arg(long)]
        c: Option<String>,

        #[arg(short, long, value_enum, default_value = "standard")]
        length: LengthArg,

        /// Extra instructions appended to the draft prompt
        #[arg(long)]
        stage_a: Option<String>,

        /// Extra instructions appended to the refine prompt
        #[arg(long)]
        stage_b: Option<String>,

        /// Extra instructions appended to the synthesis prompt
        #[arg(long)]
        stage_c: Option<String>,

        /// Base system instructions
        #[arg(long)]
        instructions: Option<String>,

        /// Credential mode per provider, e.g. openai=byok (repeatable)
        #[arg(short, long = "mode", value_parser = parse_mode_pair)]
        modes: Vec<(String, CredentialMode)>,
    },

    /// Run the background worker
    Work {
        /// Process at most one job, then exit
        #[arg(long)]
        once: bool,

        /// Concurrent runs (overrides configuration)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Execute a run immediately, bypassing the queue
    Execute {
        run_id: String,

        #[arg(short, long = "mode", value_parser = parse_mode_pair)]
        modes: Vec<(String, CredentialMode)>,
    },

    /// Print a run's event stream
    Events {
        run_id: String,

        /// Resume after this cursor
        #[arg(long, default_value = "0")]
        after: u64,

        /// Keep waiting for new events until the run finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Show a run with its artifacts and scores
    Status {
        run_id: String,
    },

    /// Store an encrypted provider key read from stdin
    SetKey {
        provider: String,

        /// Disable the stored key instead of replacing it
        #[arg(long)]
        disable: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LengthArg {
    Brief,
    Standard,
    Comprehensive,
}

impl From<LengthArg> for OutputLength {
    fn from(arg: LengthArg) -> Self {
        match arg {
            LengthArg::Brief => OutputLength::Brief,
            LengthArg::Standard => OutputLength::Standard,
            LengthArg::Comprehensive => OutputLength::Comprehensive,
        }
    }
}

fn parse_mode_pair(raw: &str) -> Result<(String, CredentialMode), String> {
    let (provider, mode) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected provider=mode, got '{}'", raw))?;
    let mode = CredentialMode::parse(mode)
        .ok_or_else(|| format!("unknown credential mode '{}' (byok, managed, auto)", mode))?;
    Ok((provider.trim().to_ascii_lowercase(), mode))
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid run ID: {}", raw))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load().context("Invalid configuration")?;

        match self.command {
            Commands::Submit {
                query,
                a,
                b,
                c,
                length,
                stage_a,
                stage_b,
                stage_c,
                instructions,
                modes,
            } => {
                let mut run = Run::new(query).with_output_length(length.into());
                for (slot, model, stage) in [
                    (Slot::A, a, stage_a),
                    (Slot::B, b, stage_b),
                    (Slot::C, c, stage_c),
                ] {
                    if let Some(model) = model {
                        run = run.with_model(slot, model);
                    }
                    if let Some(stage) = stage {
                        run = run.with_stage_prompt(slot, stage);
                    }
                }
                if let Some(instructions) = instructions {
                    run = run.with_instructions(instructions);
                }
                submit(&settings, run, modes.into_iter().collect()).await
            }
            Commands::Work { once, concurrency } => work(&settings, once, concurrency).await,
            Commands::Execute { run_id, modes } => {
                execute_now(&settings, parse_run_id(&run_id)?, modes.into_iter().collect()).await
            }
            Commands::Events {
                run_id,
                after,
                follow,
            } => show_events(&settings, parse_run_id(&run_id)?, after, follow).await,
            Commands::Status { run_id } => show_status(&settings, parse_run_id(&run_id)?),
            Commands::SetKey { provider, disable } => set_key(&settings, &provider, disable),
            Commands::Config => show_config(&settings),
        }
    }
}

async fn submit(
    settings: &Settings,
    run: Run,
    modes: HashMap<String, CredentialMode>,
) -> Result<()> {
    if Slot::ALL.iter().all(|slot| run.model_for(*slot).is_none()) {
        bail!("Assign a model to at least one slot (--a, --b or --c)");
    }

    let store = SqliteStore::open(&settings.database)?;
    store.insert_run(&run)?;

    let queue = JobQueue::new(settings.queue_path());
    let job = queue.enqueue(&run.id.to_string(), modes).await?;

    println!("{}", run.id);
    eprintln!("[Run queued as job {}]", job.id);
    Ok(())
}

async fn work(settings: &Settings, once: bool, concurrency: Option<usize>) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_settings(settings)?);
    let worker = Worker::new(
        orchestrator,
        JobQueue::new(settings.queue_path()),
        concurrency.unwrap_or(settings.worker_concurrency),
    );

    if !once {
        return worker.run().await;
    }

    match worker.run_once().await? {
        None => eprintln!("No pending jobs"),
        Some(JobOutcome::Completed(report)) => eprintln!(
            "[Run {} completed: {} pass(es), {} failed]",
            report.run_id,
            report.artifacts.len(),
            report.failed_passes()
        ),
        Some(JobOutcome::Dropped) => eprintln!("[Dropped job with an invalid run id]"),
        Some(JobOutcome::RunMissing) => eprintln!("[Job referenced a run that does not exist]"),
        Some(JobOutcome::Failed(error)) => eprintln!("[Job failed: {}]", error),
    }
    Ok(())
}

async fn execute_now(
    settings: &Settings,
    run_id: Uuid,
    modes: HashMap<String, CredentialMode>,
) -> Result<()> {
    let orchestrator = Orchestrator::from_settings(settings)?;
    let report = orchestrator.execute_run(run_id, &modes).await?;

    for artifact in &report.artifacts {
        println!(
            "--- Pass {} ({}) {} ---",
            artifact.pass_index,
            artifact.role.as_str(),
            artifact.model_id
        );
        match &artifact.error {
            Some(error) => println!("[error] {}", error),
            None => println!("{}", artifact.output_text),
        }
        println!();
    }
    eprintln!(
        "[Run {} completed: {} pass(es), {} failed]",
        report.run_id,
        report.artifacts.len(),
        report.failed_passes()
    );
    Ok(())
}

async fn show_events(settings: &Settings, run_id: Uuid, after: u64, follow: bool) -> Result<()> {
    let events = EventStore::new(settings.runs_dir());
    let mut subscription = events.subscribe(run_id, after).await?;

    if !follow {
        while let Some(stored) = subscription.try_next().await? {
            print!("{}", stored.to_sse_frame());
        }
        return Ok(());
    }

    loop {
        let stored = subscription.next().await?;
        print!("{}", stored.to_sse_frame());
        if matches!(
            stored.event.event_type,
            EventType::RunCompleted | EventType::RunError
        ) {
            return Ok(());
        }
    }
}

fn show_status(settings: &Settings, run_id: Uuid) -> Result<()> {
    let store = SqliteStore::open(&settings.database)?;
    let run = store
        .get_run(run_id)?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Status: {}", run.status.as_str());
    println!("Query: {}", run.query);
    println!("Output length: {}", run.output_length.as_str());
    println!("Created: {}", run.created_at);
    if let Some(started) = run.started_at {
        println!("Started: {}", started);
    }
    if let Some(ended) = run.ended_at {
        println!("Ended: {}", ended);
    }

    let scores = store.list_scores(run_id)?;
    println!("\nPasses:");
    for artifact in store.list_artifacts(run_id)? {
        let score = scores
            .iter()
            .find(|s| s.artifact_id == artifact.id)
            .map(|s| format!("{:.2}", s.total))
            .unwrap_or_else(|| "-".to_string());
        let state = match &artifact.error {
            Some(error) => format!("error: {}", error),
            None => format!("{} chars", artifact.output_text.chars().count()),
        };
        println!(
            "  {} {:<10} {:<32} score {:<5} {}",
            artifact.pass_index,
            artifact.role.as_str(),
            artifact.model_id,
            score,
            state
        );
    }

    if !run.total_usage.is_empty() {
        println!("\nUsage:");
        for (key, value) in run.total_usage.iter() {
            println!("  {}: {}", key, value);
        }
    }
    Ok(())
}

fn set_key(settings: &Settings, provider: &str, disable: bool) -> Result<()> {
    let provider = provider.trim().to_ascii_lowercase();
    let store = SqliteStore::open(&settings.database)?;

    if disable {
        let mut key = store
            .provider_key(&provider)?
            .with_context(|| format!("No stored key for provider {}", provider))?;
        key.enabled = false;
        store.upsert_provider_key(&key)?;
        eprintln!("[Disabled stored key for {}]", provider);
        return Ok(());
    }

    let secrets = settings.secret_store()?;
    let mut secret = String::new();
    io::stdin()
        .read_to_string(&mut secret)
        .context("Failed to read key from stdin")?;
    let secret = secret.trim();
    if secret.is_empty() {
        bail!("No key provided on stdin");
    }

    let ciphertext = secrets
        .encrypt(secret)
        .context("Failed to encrypt key")?;
    store.upsert_provider_key(&ProviderKey::new(&provider, ciphertext))?;
    eprintln!("[Stored key for {}]", provider);
    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    println!("chriseon configuration");
    println!();
    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", settings.home.display());
    println!("  Database: {}", settings.database.display());
    println!("  Runs:     {}", settings.runs_dir().display());
    println!("  Queue:    {}", settings.queue_path().display());
    println!();
    println!("Execution:");
    println!("  Isolation:        {}", settings.execution_mode.as_str());
    println!("  Provider timeout: {}s", settings.provider_timeout.as_secs());
    println!("  Concurrency:      {}", settings.worker_concurrency);
    println!("  Judge model:      {}", settings.judge_model);
    println!();
    println!("Keys:");
    println!(
        "  Master key:   {}",
        if settings.secret_store().is_ok() {
            "configured"
        } else {
            "(not set)"
        }
    );
    let managed = settings.managed_keys.providers();
    println!(
        "  Managed keys: {}",
        if managed.is_empty() {
            "(none)".to_string()
        } else {
            managed.join(", ")
        }
    );
    Ok(())
}
