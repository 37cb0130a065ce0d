//! Worker Integration Tests
//!
//! Tests for claiming queued jobs and recording their outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use uuid::Uuid;

use chriseon::adapters::{Generation, GenerationRequest, ProviderAdapter, ProviderRegistry};
use chriseon::config::ManagedKeys;
use chriseon::core::{CredentialResolver, EventStore, ExecutionMode, Orchestrator, ProviderExecutor};
use chriseon::domain::{CredentialMode, EventType, Run, RunStatus, Slot};
use chriseon::store::{RunStore, SqliteStore};
use chriseon::tools::{ToolDefinition, ToolExecutor};
use chriseon::worker::{JobOutcome, JobQueue, JobStatus, Worker};

struct Echo;

#[async_trait]
impl ProviderAdapter for Echo {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        Ok(Generation::text(format!("echo: {}", request.input)))
    }
}

struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(&self, _name: &str, _arguments: Value) -> Value {
        Value::Null
    }

    fn format_result(&self, name: &str, _result: &Value) -> String {
        name.to_string()
    }
}

fn setup(dir: &TempDir) -> (Arc<Orchestrator>, Arc<dyn RunStore>, JobQueue) {
    let store: Arc<dyn RunStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(Echo));

    let orchestrator = Orchestrator::new(
        store.clone(),
        EventStore::new(dir.path().join("runs")),
        CredentialResolver::new(
            store.clone(),
            None,
            ManagedKeys::new().with("openai", "sk-managed"),
        ),
        Arc::new(ProviderExecutor::new(
            Arc::new(registry),
            ExecutionMode::Inline,
            Duration::from_secs(5),
        )),
        Arc::new(NoTools),
    );

    (
        Arc::new(orchestrator),
        store,
        JobQueue::new(dir.path().join("jobs.jsonl")),
    )
}

#[tokio::test]
async fn test_run_once_executes_queued_run() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, store, queue) = setup(&dir);

    let run = Run::new("hello").with_model(Slot::A, "openai:gpt-4o-mini");
    store.insert_run(&run).unwrap();
    let modes = HashMap::from([("openai".to_string(), CredentialMode::Managed)]);
    let job = queue.enqueue(&run.id.to_string(), modes).await.unwrap();

    let worker = Worker::new(orchestrator.clone(), queue.clone(), 1);
    let outcome = worker.run_once().await.unwrap().unwrap();

    match outcome {
        JobOutcome::Completed(report) => {
            assert_eq!(report.status, RunStatus::Completed);
            assert!(report.artifacts[0].output_text.starts_with("echo: "));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(queue.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_bad_jobs_are_marked_failed() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _store, queue) = setup(&dir);

    let garbage = queue.enqueue("not-a-uuid", HashMap::new()).await.unwrap();
    let missing_id = Uuid::new_v4();
    let missing = queue
        .enqueue(&missing_id.to_string(), HashMap::new())
        .await
        .unwrap();

    let worker = Worker::new(orchestrator.clone(), queue.clone(), 1);
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Some(JobOutcome::Dropped)
    ));
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Some(JobOutcome::RunMissing)
    ));

    let garbage = queue.get(garbage.id).await.unwrap().unwrap();
    assert_eq!(garbage.status, JobStatus::Failed);
    assert_eq!(garbage.error.as_deref(), Some("invalid run id"));
    assert_eq!(
        queue.get(missing.id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );

    let events = orchestrator.events().replay(missing_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.event_type, EventType::RunError);
}

#[tokio::test]
async fn test_run_until_drains_queue() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, store, queue) = setup(&dir);

    let mut run_ids = Vec::new();
    for i in 0..3 {
        let run = Run::new(format!("query {}", i)).with_model(Slot::A, "openai:gpt-4o-mini");
        store.insert_run(&run).unwrap();
        queue
            .enqueue(&run.id.to_string(), HashMap::new())
            .await
            .unwrap();
        run_ids.push(run.id);
    }

    let worker = Worker::new(orchestrator, queue.clone(), 2)
        .with_poll_interval(Duration::from_millis(10));
    let watched = queue.clone();
    worker
        .run_until(async move {
            loop {
                if watched.status().await.unwrap().done == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

    for id in run_ids {
        assert_eq!(
            store.get_run(id).unwrap().unwrap().status,
            RunStatus::Completed
        );
    }
}
