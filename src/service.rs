use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::jobs::{
    JobListFilter, JobMutation, JobRecord, JobStatus, JobStore, NewJob, OutputArtifact,
};
use crate::engine::identify::{self, ImageInfo};
use crate::engine::{catalog, CommandCompiler, CommandPreview, Operation};
use crate::error::CoreError;
use crate::offload::BlockingPool;
use crate::queue::{new_job_id, QueueAdapter, QueueStats, WorkUnit};
use crate::reconcile::{artifact_for, StateReconciler, ERROR_EXCERPT_LIMIT};
use crate::sandbox::{excerpt, SharedCommandRunner};
use crate::settings::Settings;
use crate::storage::SharedFileProvider;

const RAW_DEFAULT_OUTPUT_FORMAT: &str = "png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub default_output_format: String,
    pub default_quality: u8,
    pub per_item_timeout: Duration,
    pub preview_max_size: u32,
}

impl ServiceOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_output_format: settings.default_output_format.clone(),
            default_quality: settings.default_quality,
            per_item_timeout: settings.per_item_timeout(),
            preview_max_size: settings.preview_max_size,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchRequest {
    pub input_files: Vec<String>,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawRequest {
    pub input_files: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncEditRequest {
    pub input_file: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEditOutcome {
    pub job: JobRecord,
    pub output_file: String,
}

/// History label for an instant edit, picked from the first matching group.
pub fn classify_edit(operations: &[Operation]) -> &'static str {
    let names: Vec<String> = operations
        .iter()
        .map(|op| catalog::normalize_operation_name(op.operation.as_str()))
        .collect();
    let has = |candidates: &[&str]| names.iter().any(|name| candidates.contains(&name.as_str()));

    if has(&["crop"]) {
        "crop"
    } else if has(&["brightness-contrast", "modulate"]) {
        "adjustments"
    } else if has(&["blur", "sharpen"]) {
        "filter"
    } else if has(&["watermark", "annotate"]) {
        "watermark"
    } else if has(&["rotate", "flip", "flop"]) {
        "rotate"
    } else if has(&["resize"]) {
        "resize"
    } else if has(&["sepia-tone", "grayscale"]) {
        "filter"
    } else if has(&["enhance", "auto-level"]) {
        "auto_enhance"
    } else {
        "edit"
    }
}

/// Request-side entry point: accepts edits, hands long work to the queue and
/// answers status questions through the reconciler.
#[derive(Clone)]
pub struct EditService {
    compiler: Arc<CommandCompiler>,
    runner: SharedCommandRunner,
    files: SharedFileProvider,
    queue: QueueAdapter,
    reconciler: StateReconciler,
    pool: BlockingPool,
    options: ServiceOptions,
}

impl EditService {
    pub fn new(
        compiler: Arc<CommandCompiler>,
        runner: SharedCommandRunner,
        files: SharedFileProvider,
        queue: QueueAdapter,
        reconciler: StateReconciler,
        pool: BlockingPool,
        options: ServiceOptions,
    ) -> Self {
        Self {
            compiler,
            runner,
            files,
            queue,
            reconciler,
            pool,
            options,
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    fn store(&self) -> JobStore {
        self.reconciler.store().clone()
    }

    async fn offload<T, E, F>(&self, label: &'static str, func: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<CoreError> + Send + 'static,
    {
        self.pool.run_blocking(label, func).await?.map_err(Into::into)
    }

    fn output_format(&self, requested: Option<&str>, fallback: &str) -> Result<String, CoreError> {
        let format = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback)
            .to_ascii_lowercase();
        if catalog::is_allowed_output_format(format.as_str()) {
            Ok(format)
        } else {
            Err(CoreError::Validation(format!(
                "Unsupported output format: {format}"
            )))
        }
    }

    async fn resolve_input(&self, reference: &str) -> Result<PathBuf, CoreError> {
        let files = self.files.clone();
        let reference = reference.to_string();
        self.offload("storage.resolve_input", move || -> Result<PathBuf, CoreError> {
            let path = files.resolve_input(reference.as_str())?;
            catalog::validate_input_file(path.as_path())?;
            Ok(path)
        })
        .await
    }

    /// Rejects raw text before any job exists: blocked patterns first, then
    /// quoting errors.
    pub fn validate_command(&self, raw: &str) -> Result<(), CoreError> {
        CommandCompiler::check_raw(raw)?;
        Ok(())
    }

    pub async fn submit_batch(&self, request: BatchRequest) -> Result<JobReceipt, CoreError> {
        if request.input_files.is_empty() {
            return Err(CoreError::NotFound(String::from("No images found")));
        }
        let quality = request.quality.unwrap_or(self.options.default_quality);
        if !(1..=100).contains(&quality) {
            return Err(CoreError::Validation(String::from(
                "Quality must be between 1 and 100",
            )));
        }
        let default_format = self.options.default_output_format.clone();
        let output_format =
            self.output_format(request.output_format.as_deref(), default_format.as_str())?;

        let mut operations = request.operations;
        operations.push(Operation::quality(quality));
        let count = request.input_files.len();
        let job_id = new_job_id("job_");

        self.create_job(NewJob {
            job_id: job_id.clone(),
            operation_kind: String::from("batch_process"),
            command: Some(serde_json::to_string(&operations)?),
            input_files: request.input_files.clone(),
            parameters: json!({
                "operations": operations,
                "output_format": output_format,
                "quality": quality,
            }),
            owner: request.owner.clone(),
        })
        .await?;

        let work = WorkUnit::ProcessImages {
            input_files: request.input_files,
            operations,
            output_format,
            owner: request.owner,
        };
        self.enqueue(job_id.as_str(), work, count).await?;

        Ok(JobReceipt {
            job_id,
            status: JobStatus::Pending,
            message: format!("Processing {count} images"),
        })
    }

    pub async fn submit_raw(&self, request: RawRequest) -> Result<JobReceipt, CoreError> {
        self.validate_command(request.command.as_str())?;
        if request.input_files.is_empty() {
            return Err(CoreError::NotFound(String::from("No images found")));
        }
        let output_format =
            self.output_format(request.output_format.as_deref(), RAW_DEFAULT_OUTPUT_FORMAT)?;
        let count = request.input_files.len();
        let job_id = new_job_id("raw_");

        self.create_job(NewJob {
            job_id: job_id.clone(),
            operation_kind: String::from("raw_command"),
            command: Some(request.command.clone()),
            input_files: request.input_files.clone(),
            parameters: json!({
                "raw_command": request.command,
                "output_format": output_format,
            }),
            owner: request.owner.clone(),
        })
        .await?;

        let work = WorkUnit::ProcessRawCommand {
            input_files: request.input_files,
            raw_command: request.command,
            output_format,
            owner: request.owner,
        };
        self.enqueue(job_id.as_str(), work, count).await?;

        Ok(JobReceipt {
            job_id,
            status: JobStatus::Pending,
            message: format!("Processing {count} images with raw command"),
        })
    }

    async fn create_job(&self, new_job: NewJob) -> Result<JobRecord, CoreError> {
        let store = self.store();
        self.offload("jobs.create", move || store.create_job(new_job))
            .await
    }

    /// The job record already exists here, so a refused enqueue is recorded
    /// on it before the error is returned.
    async fn enqueue(&self, job_id: &str, work: WorkUnit, items: usize) -> Result<(), CoreError> {
        let per_item = self.options.per_item_timeout.as_secs().max(1);
        let timeout = Duration::from_secs(per_item.saturating_mul(items.max(1) as u64));
        match self
            .queue
            .enqueue(work, Some(job_id.to_string()), timeout)
            .await
        {
            Ok(_) => {
                info!(job_id = %job_id, items, timeout_secs = timeout.as_secs(), "job enqueued");
                Ok(())
            }
            Err(error) => {
                let message = format!("Queue backend unavailable: {error}");
                warn!(job_id = %job_id, error = %error, "enqueue failed");
                if let Err(mark_error) = self.mark_failed(job_id, message.clone()).await {
                    warn!(job_id = %job_id, error = %mark_error, "failed to record enqueue failure");
                }
                Err(CoreError::BackendUnavailable(message))
            }
        }
    }

    async fn mark_failed(&self, job_id: &str, message: String) -> Result<(), CoreError> {
        let store = self.store();
        let id = job_id.to_string();
        let now = Utc::now();
        self.offload("jobs.mark_failed", move || {
            store.update_job(id.as_str(), |job| {
                if !job.status.can_transition_to(JobStatus::Failed) {
                    return JobMutation::unchanged();
                }
                job.status = JobStatus::Failed;
                job.error_message = Some(message);
                job.completed_at = Some(now);
                JobMutation::changed()
            })
        })
        .await
        .map(|_| ())
    }

    /// Current job state after one reconciliation pass.
    pub async fn job_status(&self, job_id: &str) -> Result<JobRecord, CoreError> {
        Ok(self.reconciler.reconcile(job_id).await?)
    }

    pub async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<JobRecord>, CoreError> {
        let store = self.store();
        self.offload("jobs.list", move || store.list_jobs(&filter))
            .await
    }

    pub async fn job_artifacts(&self, job_id: &str) -> Result<Vec<OutputArtifact>, CoreError> {
        let store = self.store();
        let id = job_id.to_string();
        self.offload("jobs.list_artifacts", move || store.list_artifacts(id.as_str()))
            .await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord, CoreError> {
        Ok(self.reconciler.cancel(job_id).await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, CoreError> {
        Ok(self.queue.stats().await?)
    }

    /// Runs a pipeline inline and records it as a completed history job.
    /// Paginated inputs are rasterized, so their output is always PNG.
    pub async fn process_sync(&self, request: SyncEditRequest) -> Result<SyncEditOutcome, CoreError> {
        let input = self.resolve_input(request.input_file.as_str()).await?;
        let default_format = self.options.default_output_format.clone();
        let requested =
            self.output_format(request.output_format.as_deref(), default_format.as_str())?;
        let output_format = if catalog::is_paginated_input(input.as_path()) {
            String::from("png")
        } else {
            requested.clone()
        };

        let files = self.files.clone();
        let owner = request.owner.clone();
        let source = input.clone();
        let output = self
            .offload("storage.output_path", move || {
                files.output_path(owner.as_deref(), source.as_path(), output_format.as_str())
            })
            .await?;

        let started = Utc::now();
        let command = self
            .compiler
            .compile(input.as_path(), output.as_path(), &request.operations)?;
        debug!(command = %command.display(), "running instant edit");
        let result = self.runner.run(&command).await?;
        if !result.success || !output.is_file() {
            return Err(CoreError::Execution(format!(
                "Processing failed: {}",
                excerpt(result.stderr.trim(), ERROR_EXCERPT_LIMIT)
            )));
        }

        let output_file = output.to_string_lossy().to_string();
        let new_job = NewJob {
            job_id: format!("sync_{}", &Uuid::new_v4().simple().to_string()[..8]),
            operation_kind: classify_edit(&request.operations).to_string(),
            command: Some(command.display()),
            input_files: vec![request.input_file],
            parameters: json!({
                "operations": request.operations,
                "output_format": requested,
            }),
            owner: request.owner,
        };
        let store = self.store();
        let recorded = output_file.clone();
        let job = self
            .offload("jobs.record_sync", move || {
                let job_id = store.create_job(new_job)?.job_id;
                store
                    .update_job(job_id.as_str(), |job| {
                        job.status = JobStatus::Completed;
                        job.progress = 100;
                        job.started_at = Some(started);
                        job.completed_at = Some(Utc::now());
                        job.output_files = vec![recorded.clone()];
                        JobMutation {
                            changed: true,
                            artifacts: vec![artifact_for(recorded.as_str())],
                        }
                    })
                    .map(|outcome| outcome.job)
            })
            .await?;

        info!(job_id = %job.job_id, operation = %job.operation_kind, "instant edit recorded");
        Ok(SyncEditOutcome { job, output_file })
    }

    /// The command a pipeline would run, with the submission layer's quality
    /// step appended.
    pub fn preview_command(
        &self,
        operations: &[Operation],
        output_format: Option<&str>,
        quality: Option<u8>,
    ) -> CommandPreview {
        let mut operations = operations.to_vec();
        operations.push(Operation::quality(
            quality.unwrap_or(self.options.default_quality),
        ));
        let format = output_format.unwrap_or(self.options.default_output_format.as_str());
        self.compiler.preview(&operations, format)
    }

    /// Renders a size-capped WebP preview and returns it as a data URL. The
    /// temporary output is removed whether or not rendering succeeds.
    pub async fn apply_preview(
        &self,
        reference: &str,
        operations: &[Operation],
    ) -> Result<String, CoreError> {
        let input = self.resolve_input(reference).await?;
        let files = self.files.clone();
        let temp = self
            .offload("storage.temp_path", move || files.temp_path("webp"))
            .await?;

        let max = self.options.preview_max_size;
        let mut preview_ops = Vec::with_capacity(operations.len() + 1);
        preview_ops.push(
            Operation::new("resize")
                .with("width", max)
                .with("height", max)
                .with("mode", "fit"),
        );
        preview_ops.extend_from_slice(operations);

        let rendered = self
            .render_preview(input.as_path(), temp.as_path(), &preview_ops)
            .await;
        let cleanup = temp.clone();
        if let Err(error) = self
            .pool
            .run_blocking("preview.cleanup", move || std::fs::remove_file(cleanup))
            .await
        {
            debug!(error = %error, "preview cleanup did not run");
        }
        rendered
    }

    async fn render_preview(
        &self,
        input: &Path,
        temp: &Path,
        operations: &[Operation],
    ) -> Result<String, CoreError> {
        let command = self.compiler.compile(input, temp, operations)?;
        let result = self.runner.run(&command).await?;
        if !result.success {
            return Err(CoreError::Execution(format!(
                "Preview generation failed: {}",
                excerpt(result.stderr.trim(), ERROR_EXCERPT_LIMIT)
            )));
        }
        let path = temp.to_path_buf();
        let bytes = self
            .pool
            .run_blocking("preview.read", move || std::fs::read(path))
            .await?
            .map_err(|_| {
                CoreError::Execution(String::from("Preview generation produced no output"))
            })?;
        Ok(format!(
            "data:image/webp;base64,{}",
            BASE64_STANDARD.encode(bytes)
        ))
    }

    /// Format, geometry and colour details from the engine's identify tool.
    pub async fn image_info(&self, reference: &str) -> Result<Option<ImageInfo>, CoreError> {
        let path = self.resolve_input(reference).await?;
        Ok(identify::probe_image(&self.compiler, self.runner.as_ref(), path.as_path()).await?)
    }
}
