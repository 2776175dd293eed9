pub mod tasks;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::queue::{BackendStatus, QueueAdapter, QueueBackendRecord, QueueError};
use tasks::{BatchExecutor, BatchOutcome, ProgressSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub finished: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl WorkerSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Finished => self.finished += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Finished,
    Failed,
    /// The record was no longer started when the worker tried to end it.
    Abandoned,
}

/// Reports progress into the queue record's metadata and checks it for
/// cancellation.
struct QueueProgress {
    queue: QueueAdapter,
    job_id: String,
}

#[async_trait]
impl ProgressSink for QueueProgress {
    async fn report(&self, progress: u8, current_item: Option<String>) {
        if let Err(error) = self
            .queue
            .set_progress(self.job_id.as_str(), progress, current_item)
            .await
        {
            warn!(job_id = %self.job_id, error = %error, "failed to record progress");
        }
    }

    async fn is_cancelled(&self) -> bool {
        match self.queue.status(self.job_id.as_str()).await {
            Ok(Some(record)) => record.status == BackendStatus::Canceled,
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Claims work from the queue backend and runs up to `concurrency` batches at
/// once, each under its own deadline.
#[derive(Clone)]
pub struct QueueWorker {
    queue: QueueAdapter,
    executor: BatchExecutor,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(queue: QueueAdapter, executor: BatchExecutor, config: WorkerConfig) -> Self {
        Self {
            queue,
            executor,
            config: WorkerConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
        }
    }

    /// Claims and runs everything currently queued, then returns.
    pub async fn run_once(&self) -> Result<WorkerSummary, QueueError> {
        let mut summary = WorkerSummary::default();
        let mut running = JoinSet::new();
        loop {
            while running.len() < self.config.concurrency {
                match self.queue.claim_next().await? {
                    Some(record) => self.spawn_job(&mut running, record),
                    None => break,
                }
            }
            match running.join_next().await {
                Some(joined) => record_join(&mut summary, joined),
                None => return Ok(summary),
            }
        }
    }

    /// Polls the queue until `shutdown` resolves, then waits for in-flight
    /// jobs.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<WorkerSummary, QueueError>
    where
        F: Future<Output = ()>,
    {
        info!(
            concurrency = self.config.concurrency,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "queue worker started"
        );
        tokio::pin!(shutdown);
        let mut summary = WorkerSummary::default();
        let mut running = JoinSet::new();

        loop {
            while running.len() < self.config.concurrency {
                match self.queue.claim_next().await {
                    Ok(Some(record)) => self.spawn_job(&mut running, record),
                    Ok(None) => break,
                    Err(error) => {
                        error!(error = %error, "failed to claim queued work");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    record_join(&mut summary, joined);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(in_flight = running.len(), "queue worker stopping");
        while let Some(joined) = running.join_next().await {
            record_join(&mut summary, joined);
        }
        Ok(summary)
    }

    fn spawn_job(&self, running: &mut JoinSet<JobOutcome>, record: QueueBackendRecord) {
        let queue = self.queue.clone();
        let executor = self.executor.clone();
        running.spawn(async move { run_job(queue, executor, record).await });
    }
}

fn record_join(summary: &mut WorkerSummary, joined: Result<JobOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => summary.record(outcome),
        Err(join_error) => {
            error!(error = %join_error, "worker task panicked");
            summary.record(JobOutcome::Failed);
        }
    }
}

async fn run_job(queue: QueueAdapter, executor: BatchExecutor, record: QueueBackendRecord) -> JobOutcome {
    let job_id = record.id.clone();
    let deadline = Duration::from_secs(record.timeout_secs.max(1));
    let sink = QueueProgress {
        queue: queue.clone(),
        job_id: job_id.clone(),
    };
    info!(
        job_id = %job_id,
        items = record.work.input_files().len(),
        timeout_secs = deadline.as_secs(),
        "job started"
    );

    let ended = match tokio::time::timeout(deadline, executor.execute(&record.work, &sink)).await {
        Ok(outcome) => end_job(&queue, job_id.as_str(), outcome).await,
        Err(_) => {
            let message = format!("Job timed out after {} seconds", deadline.as_secs());
            queue
                .fail(job_id.as_str(), message)
                .await
                .map(|ended| (ended, JobOutcome::Failed))
        }
    };

    match ended {
        Ok((true, outcome)) => {
            info!(job_id = %job_id, outcome = ?outcome, "job ended");
            outcome
        }
        Ok((false, _)) => {
            info!(job_id = %job_id, "job was cancelled before it ended");
            JobOutcome::Abandoned
        }
        Err(error) => {
            error!(job_id = %job_id, error = %error, "failed to record job result");
            JobOutcome::Failed
        }
    }
}

async fn end_job(
    queue: &QueueAdapter,
    job_id: &str,
    outcome: BatchOutcome,
) -> Result<(bool, JobOutcome), QueueError> {
    if let Some(message) = outcome.failure_message() {
        return queue
            .fail(job_id, message)
            .await
            .map(|ended| (ended, JobOutcome::Failed));
    }
    let result = serde_json::to_value(&outcome).unwrap_or(Value::Null);
    queue
        .finish(job_id, result)
        .await
        .map(|ended| (ended, JobOutcome::Finished))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommandCompiler, CompiledCommand, EngineLimits, Operation};
    use crate::offload::BlockingPool;
    use crate::queue::{InMemoryQueueBackend, WorkUnit};
    use crate::sandbox::{CommandRunner, ExecutionResult, SandboxError};
    use crate::storage::LocalFileStorage;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct TouchRunner {
        delay: Duration,
    }

    #[async_trait]
    impl CommandRunner for TouchRunner {
        async fn run(&self, command: &CompiledCommand) -> Result<ExecutionResult, SandboxError> {
            tokio::time::sleep(self.delay).await;
            if let Some(output) = command.args.last() {
                let _ = std::fs::write(output, b"out");
            }
            Ok(ExecutionResult {
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: self.delay.as_millis() as u64,
            })
        }
    }

    fn setup(delay: Duration, inputs: &[&str]) -> (QueueAdapter, QueueWorker, PathBuf) {
        let root = std::env::temp_dir().join(format!("imagemill_worker_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("uploads")).expect("uploads");
        for name in inputs {
            std::fs::write(root.join("uploads").join(name), b"img").expect("input");
        }
        let pool = BlockingPool::new(8);
        let queue = QueueAdapter::new(Arc::new(InMemoryQueueBackend::default()), pool.clone());
        let executor = BatchExecutor::new(
            Arc::new(CommandCompiler::new(EngineLimits::default(), "/nonexistent").with_entry_point("magick")),
            Arc::new(TouchRunner { delay }),
            Arc::new(LocalFileStorage::new(
                root.join("uploads"),
                root.join("processed"),
                root.join("tmp"),
            )),
            pool,
        );
        let worker = QueueWorker::new(
            queue.clone(),
            executor,
            WorkerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(20),
            },
        );
        (queue, worker, root)
    }

    fn unit(inputs: &[&str]) -> WorkUnit {
        WorkUnit::ProcessImages {
            input_files: inputs.iter().map(|s| s.to_string()).collect(),
            operations: vec![Operation::new("negate")],
            output_format: String::from("png"),
            owner: None,
        }
    }

    #[tokio::test]
    async fn run_once_finishes_and_fails_jobs() {
        let (queue, worker, _root) = setup(Duration::from_millis(5), &["a.png"]);
        let good = queue
            .enqueue(unit(&["a.png"]), None, Duration::from_secs(60))
            .await
            .expect("enqueue");
        let bad = queue
            .enqueue(unit(&["missing.png"]), None, Duration::from_secs(60))
            .await
            .expect("enqueue");

        let summary = worker.run_once().await.expect("run");
        assert_eq!(summary.finished, 1);
        assert_eq!(summary.failed, 1);

        let good = queue.status(good.as_str()).await.expect("fetch").expect("record");
        assert_eq!(good.status, BackendStatus::Finished);
        assert_eq!(good.meta.progress, 100);
        let result: BatchOutcome =
            serde_json::from_value(good.result.expect("result")).expect("batch outcome");
        assert_eq!(result.output_files.len(), 1);

        let bad = queue.status(bad.as_str()).await.expect("fetch").expect("record");
        assert_eq!(bad.status, BackendStatus::Failed);
        assert_eq!(
            bad.exc_info.as_deref(),
            Some("All 1 inputs failed: File not found: missing.png")
        );
    }

    #[tokio::test]
    async fn per_job_deadline_fails_slow_jobs() {
        let (queue, worker, _root) = setup(Duration::from_secs(5), &["a.png"]);
        let id = queue
            .enqueue(unit(&["a.png"]), None, Duration::from_secs(1))
            .await
            .expect("enqueue");
        let summary = worker.run_once().await.expect("run");
        assert_eq!(summary.failed, 1);
        let record = queue.status(id.as_str()).await.expect("fetch").expect("record");
        assert_eq!(record.exc_info.as_deref(), Some("Job timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let (queue, worker, _root) = setup(Duration::from_millis(5), &["a.png"]);
        queue
            .enqueue(unit(&["a.png"]), None, Duration::from_secs(60))
            .await
            .expect("enqueue");
        let summary = worker
            .run_until(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .expect("run");
        assert_eq!(summary.finished, 1);
        assert_eq!(queue.stats().await.expect("stats").finished, 1);
    }
}
