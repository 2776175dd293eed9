use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::jobs::{
    JobMutation, JobRecord, JobStatus, JobStore, JobsRepoError, NewOutputArtifact,
};
use crate::offload::{BlockingPool, OffloadError};
use crate::queue::{
    BackendStatus, QueueAdapter, QueueBackendRecord, QueueError, ABANDONED_MESSAGE,
};
use crate::storage::mime_for_path;

/// A pending or processing job whose queue record is gone for longer than
/// this is declared lost.
pub const EXPIRY_GRACE: Duration = Duration::from_secs(300);
pub const ERROR_EXCERPT_LIMIT: usize = 500;
pub const EXPIRED_MESSAGE: &str = "Job expired or was lost before completion. Please try again.";
const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(JobsRepoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Offload(#[from] OffloadError),
}

impl ReconcileError {
    fn from_store(job_id: &str, error: JobsRepoError) -> Self {
        match error {
            JobsRepoError::NotFound => Self::NotFound(job_id.to_string()),
            other => Self::Store(other),
        }
    }
}

/// Field changes derived from the queue record. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_files: Option<Vec<String>>,
    pub result: Option<Value>,
}

impl JobPatch {
    /// Applies the patch unless it would move the status backward. Returns
    /// whether the record changed.
    pub fn apply(&self, job: &mut JobRecord) -> bool {
        if job.status.is_terminal() {
            return false;
        }
        if let Some(next) = self.status {
            if next != job.status && !job.status.can_transition_to(next) {
                return false;
            }
        }

        let before = job.clone();
        if let Some(next) = self.status {
            job.status = next;
        }
        if let Some(progress) = self.progress {
            job.progress = progress.min(100);
        }
        if job.started_at.is_none() {
            job.started_at = self.started_at;
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(message) = self.error_message.as_ref() {
            job.error_message = Some(message.clone());
        }
        if let Some(outputs) = self.output_files.as_ref() {
            job.output_files = outputs.clone();
        }
        if let Some(result) = self.result.as_ref() {
            job.result = Some(result.clone());
        }
        *job != before
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_EXCERPT_LIMIT).collect()
}

fn output_files_of(result: Option<&Value>) -> Vec<String> {
    result
        .and_then(|value| value.get("output_files"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The single transition function: what the durable record should become
/// given what the queue reports at `now`.
pub fn plan_transition(
    job: &JobRecord,
    backend: Option<&QueueBackendRecord>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Option<JobPatch> {
    if job.status.is_terminal() {
        return None;
    }

    let Some(record) = backend else {
        let age = (now - job.created_at).to_std().unwrap_or_default();
        if age <= grace {
            return None;
        }
        return Some(JobPatch {
            status: Some(JobStatus::Failed),
            completed_at: Some(now),
            error_message: Some(EXPIRED_MESSAGE.to_string()),
            ..JobPatch::default()
        });
    };

    let progress = Some(record.meta.progress.min(100));
    let patch = match record.status {
        BackendStatus::Queued => JobPatch {
            progress,
            ..JobPatch::default()
        },
        BackendStatus::Started if record.is_abandoned(now, grace) => JobPatch {
            status: Some(JobStatus::Failed),
            progress,
            started_at: record.started_at,
            completed_at: Some(now),
            error_message: Some(ABANDONED_MESSAGE.to_string()),
            ..JobPatch::default()
        },
        BackendStatus::Started => JobPatch {
            status: Some(JobStatus::Processing),
            progress,
            started_at: Some(record.started_at.unwrap_or(now)),
            ..JobPatch::default()
        },
        BackendStatus::Finished => JobPatch {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            started_at: record.started_at,
            completed_at: Some(record.ended_at.unwrap_or(now)),
            output_files: Some(output_files_of(record.result.as_ref())),
            result: record.result.clone(),
            ..JobPatch::default()
        },
        BackendStatus::Failed => JobPatch {
            status: Some(JobStatus::Failed),
            progress,
            started_at: record.started_at,
            completed_at: Some(record.ended_at.unwrap_or(now)),
            error_message: Some(excerpt(record.exc_info.as_deref().unwrap_or(UNKNOWN_ERROR))),
            ..JobPatch::default()
        },
        BackendStatus::Canceled => JobPatch {
            status: Some(JobStatus::Cancelled),
            progress,
            completed_at: Some(record.ended_at.unwrap_or(now)),
            ..JobPatch::default()
        },
    };
    Some(patch)
}

pub(crate) fn artifact_for(path: &str) -> NewOutputArtifact {
    let file = Path::new(path);
    let stored = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    let original_stem = stored.split('_').next().unwrap_or(stored.as_str());
    NewOutputArtifact {
        file_path: path.to_string(),
        original_filename: Some(format!("processed_{original_stem}")),
        mime_type: Some(mime_for_path(file).to_string()),
        file_size: std::fs::metadata(file).ok().map(|meta| meta.len()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub changed: usize,
    pub errors: usize,
}

/// Merges queue state into durable job records on demand.
#[derive(Debug, Clone)]
pub struct StateReconciler {
    store: JobStore,
    queue: QueueAdapter,
    pool: BlockingPool,
    grace: Duration,
}

impl StateReconciler {
    pub fn new(store: JobStore, queue: QueueAdapter, pool: BlockingPool) -> Self {
        Self {
            store,
            queue,
            pool,
            grace: EXPIRY_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn load(&self, job_id: &str) -> Result<JobRecord, ReconcileError> {
        let store = self.store.clone();
        let id = job_id.to_string();
        self.pool
            .run_blocking("jobs.get", move || store.get_job(id.as_str()))
            .await?
            .map_err(|error| ReconcileError::from_store(job_id, error))
    }

    pub async fn reconcile(&self, job_id: &str) -> Result<JobRecord, ReconcileError> {
        self.reconcile_at(job_id, Utc::now()).await
    }

    /// One reconciliation pass evaluated at `now`. Terminal jobs are returned
    /// without touching the queue or writing.
    pub async fn reconcile_at(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, ReconcileError> {
        let job = self.load(job_id).await?;
        if job.is_finished() {
            return Ok(job);
        }

        let backend = self.queue.status(job_id).await?;
        let grace = self.grace;
        let store = self.store.clone();
        let id = job_id.to_string();
        let outcome = self
            .pool
            .run_blocking("jobs.reconcile", move || {
                store.update_job(id.as_str(), |job| {
                    let Some(patch) = plan_transition(job, backend.as_ref(), now, grace) else {
                        return JobMutation::unchanged();
                    };
                    let was = job.status;
                    if !patch.apply(job) {
                        return JobMutation::unchanged();
                    }
                    let artifacts = if job.status == JobStatus::Completed && was != JobStatus::Completed {
                        job.output_files.iter().map(|path| artifact_for(path)).collect()
                    } else {
                        Vec::new()
                    };
                    JobMutation {
                        changed: true,
                        artifacts,
                    }
                })
            })
            .await?
            .map_err(|error| ReconcileError::from_store(job_id, error))?;

        if outcome.changed {
            info!(
                job_id = %job_id,
                status = outcome.job.status.as_str(),
                progress = outcome.job.progress,
                materialized = outcome.materialized,
                duration_secs = ?outcome.job.duration(),
                "job reconciled"
            );
        }
        Ok(outcome.job)
    }

    /// Reconciles every pending or processing job. Failures are logged and
    /// counted; the pass continues.
    pub async fn reconcile_active(&self) -> Result<ReconcileSummary, ReconcileError> {
        let store = self.store.clone();
        let active = self
            .pool
            .run_blocking("jobs.list_active", move || store.list_active_jobs())
            .await?
            .map_err(ReconcileError::Store)?;

        let mut summary = ReconcileSummary::default();
        for job in active {
            summary.examined += 1;
            match self.reconcile(job.job_id.as_str()).await {
                Ok(updated) if updated != job => summary.changed += 1,
                Ok(_) => {}
                Err(error) => {
                    summary.errors += 1;
                    warn!(job_id = %job.job_id, error = %error, "reconciliation failed");
                }
            }
        }
        Ok(summary)
    }

    /// Cancels a pending or processing job. The queue is asked to cancel but
    /// the durable record is cancelled whatever it answers.
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord, ReconcileError> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Err(ReconcileError::InvalidState(String::from(
                "Can only cancel pending or processing jobs",
            )));
        }

        match self.queue.cancel(job_id).await {
            Ok(acknowledged) => debug!(job_id = %job_id, acknowledged, "queue cancel requested"),
            Err(error) => warn!(job_id = %job_id, error = %error, "queue cancel failed"),
        }

        let store = self.store.clone();
        let id = job_id.to_string();
        let now = Utc::now();
        let outcome = self
            .pool
            .run_blocking("jobs.cancel", move || {
                store.update_job(id.as_str(), |job| {
                    if !job.status.can_transition_to(JobStatus::Cancelled) {
                        return JobMutation::unchanged();
                    }
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(now);
                    JobMutation::changed()
                })
            })
            .await?
            .map_err(|error| ReconcileError::from_store(job_id, error))?;

        if outcome.changed {
            info!(job_id = %job_id, "job cancelled");
        }
        Ok(outcome.job)
    }
}
