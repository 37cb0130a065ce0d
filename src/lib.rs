//! chriseon - multi-pass AI refinement worker
//!
//! A query goes through three ordered passes (draft, refine, synthesis),
//! each run by a possibly different AI provider, with optional tool use
//! between calls. Every pass's output is scored and every step is recorded
//! in a per-run event log that clients can follow live.
//!
//! # Architecture
//!
//! - Each run is executed end-to-end by one worker task, passes strictly in order
//! - A failed pass is recorded on its artifact; the run still completes
//! - Provider calls are timed out and isolated on their own task
//! - Progress is an append-only JSONL log per run, read with resumable cursors
//!
//! # Modules
//!
//! - `adapters`: AI provider integrations (OpenAI-compatible, Anthropic, Gemini)
//! - `core`: Run execution engine (orchestrator, executor, tool session, scoring)
//! - `domain`: Data structures (Run, Artifact, Score, Event)
//! - `tools`: Model-callable tools (web search, URL fetch, breach lookup)
//! - `store`: SQLite persistence
//! - `worker`: Job queue and worker loop
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue a run
//! chriseon submit "Compare tokio and async-std" --a openai:gpt-4o --b anthropic:claude-sonnet-4-5
//!
//! # Process queued runs
//! chriseon work
//!
//! # Follow progress
//! chriseon events <run-id> --follow
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod domain;
pub mod secrets;
pub mod store;
pub mod tools;
pub mod worker;

// Re-export main types at crate root for convenience
pub use config::Settings;
pub use core::{Orchestrator, RunReport};
pub use domain::{Artifact, Event, EventType, Run, RunStatus, Score};
pub use store::{RunStore, SqliteStore};
