pub mod memory_backend;
pub mod sqlite_backend;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Operation;
use crate::offload::{BlockingPool, OffloadError};

pub use memory_backend::InMemoryQueueBackend;
pub use sqlite_backend::SqliteQueueBackend;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(86_400);
/// Slack past a started record's own timeout before it is declared abandoned.
pub const ABANDON_GRACE: Duration = Duration::from_secs(300);
pub const ABANDONED_MESSAGE: &str =
    "Job abandoned: the worker stopped before reporting a result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Canceled,
}

impl BackendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "started" => Some(Self::Started),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_ended(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMeta {
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A unit of background work: which task to run and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    ProcessImages {
        input_files: Vec<String>,
        operations: Vec<Operation>,
        output_format: String,
        owner: Option<String>,
    },
    ProcessRawCommand {
        input_files: Vec<String>,
        raw_command: String,
        output_format: String,
        owner: Option<String>,
    },
}

impl WorkUnit {
    pub fn input_files(&self) -> &[String] {
        match self {
            Self::ProcessImages { input_files, .. } | Self::ProcessRawCommand { input_files, .. } => {
                input_files.as_slice()
            }
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::ProcessImages { owner, .. } | Self::ProcessRawCommand { owner, .. } => owner.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueBackendRecord {
    pub id: String,
    pub status: BackendStatus,
    pub work: WorkUnit,
    pub result: Option<Value>,
    pub meta: BackendMeta,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exc_info: Option<String>,
    pub timeout_secs: u64,
}

impl QueueBackendRecord {
    pub fn new(id: impl Into<String>, work: WorkUnit, timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: BackendStatus::Queued,
            work,
            result: None,
            meta: BackendMeta::default(),
            created_at: now,
            started_at: None,
            ended_at: None,
            exc_info: None,
            timeout_secs: timeout.as_secs().max(1),
        }
    }

    /// Ended records disappear once the retention window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.ended_at {
            Some(ended) => match chrono::Duration::from_std(retention) {
                Ok(window) => ended + window <= now,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// A started record whose worker should have finished or failed it by
    /// `started_at + timeout_secs`, plus `grace`.
    pub fn is_abandoned(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if self.status != BackendStatus::Started {
            return false;
        }
        let (Some(started), Ok(window)) = (
            self.started_at,
            chrono::Duration::from_std(Duration::from_secs(self.timeout_secs) + grace),
        ) else {
            return false;
        };
        started + window <= now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl QueueStats {
    pub(crate) fn add(&mut self, status: BackendStatus, count: u64) {
        let slot = match status {
            BackendStatus::Queued => &mut self.queued,
            BackendStatus::Started => &mut self.started,
            BackendStatus::Finished => &mut self.finished,
            BackendStatus::Failed => &mut self.failed,
            BackendStatus::Canceled => &mut self.canceled,
        };
        *slot += count;
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue record '{0}' already exists")]
    Duplicate(String),
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
    #[error("queue record is corrupt: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Offload(#[from] OffloadError),
}

/// Storage for queue records. Implementations are synchronous; async callers
/// go through [`QueueAdapter`].
pub trait QueueBackend: Send + Sync + 'static {
    fn enqueue(&self, record: QueueBackendRecord) -> Result<(), QueueError>;
    fn fetch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError>;
    /// Returns true when a queued or started record was moved to canceled.
    fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError>;
    fn set_meta(&self, id: &str, meta: &BackendMeta) -> Result<bool, QueueError>;
    /// Atomically moves the oldest queued record to started.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError>;
    /// Both return false when the record is no longer started, e.g. after a cancel.
    fn finish(&self, id: &str, result: &Value, now: DateTime<Utc>) -> Result<bool, QueueError>;
    fn fail(&self, id: &str, exc_info: &str, now: DateTime<Utc>) -> Result<bool, QueueError>;
    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError>;
    fn pending(&self, limit: usize) -> Result<Vec<QueueBackendRecord>, QueueError>;
    fn clear_failed(&self) -> Result<u64, QueueError>;
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;
    /// Fails started records past their timeout plus [`ABANDON_GRACE`] with
    /// [`ABANDONED_MESSAGE`]. Returns how many were failed.
    fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;
}

pub type SharedQueueBackend = Arc<dyn QueueBackend>;

pub fn new_job_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

/// Async face of a [`QueueBackend`]. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct QueueAdapter {
    backend: SharedQueueBackend,
    pool: BlockingPool,
}

impl std::fmt::Debug for QueueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueAdapter").field("pool", &self.pool).finish()
    }
}

impl QueueAdapter {
    pub fn new(backend: SharedQueueBackend, pool: BlockingPool) -> Self {
        Self { backend, pool }
    }

    pub fn backend(&self) -> SharedQueueBackend {
        self.backend.clone()
    }

    async fn call<T, F>(&self, label: &'static str, func: F) -> Result<T, QueueError>
    where
        F: FnOnce(&dyn QueueBackend) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.backend.clone();
        self.pool
            .run_blocking(label, move || func(backend.as_ref()))
            .await?
    }

    pub async fn enqueue(
        &self,
        work: WorkUnit,
        job_id: Option<String>,
        timeout: Duration,
    ) -> Result<String, QueueError> {
        let id = job_id.unwrap_or_else(|| new_job_id("job_"));
        let record = QueueBackendRecord::new(id.clone(), work, timeout, Utc::now());
        self.call("queue.enqueue", move |backend| backend.enqueue(record))
            .await?;
        debug!(job_id = %id, "enqueued work unit");
        Ok(id)
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<QueueBackendRecord>, QueueError> {
        let id = job_id.to_string();
        self.call("queue.fetch", move |backend| backend.fetch(id.as_str(), Utc::now()))
            .await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let id = job_id.to_string();
        self.call("queue.cancel", move |backend| backend.cancel(id.as_str(), Utc::now()))
            .await
    }

    pub async fn set_progress(
        &self,
        job_id: &str,
        progress: u8,
        current_item: Option<String>,
    ) -> Result<bool, QueueError> {
        let id = job_id.to_string();
        let meta = BackendMeta {
            progress: progress.min(100),
            current_item,
            message: None,
        };
        self.call("queue.set_meta", move |backend| backend.set_meta(id.as_str(), &meta))
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.call("queue.stats", |backend| backend.stats(Utc::now())).await
    }

    pub async fn pending(&self, limit: usize) -> Result<Vec<QueueBackendRecord>, QueueError> {
        self.call("queue.pending", move |backend| backend.pending(limit))
            .await
    }

    pub async fn clear_failed(&self) -> Result<u64, QueueError> {
        self.call("queue.clear_failed", |backend| backend.clear_failed())
            .await
    }

    /// Sweeps abandoned records first so a crashed worker's jobs end as
    /// failed instead of staying started.
    pub async fn claim_next(&self) -> Result<Option<QueueBackendRecord>, QueueError> {
        self.call("queue.claim_next", |backend| {
            let now = Utc::now();
            let abandoned = backend.fail_abandoned(now)?;
            if abandoned > 0 {
                warn!(abandoned, "failed abandoned queue records");
            }
            backend.claim_next(now)
        })
        .await
    }

    pub async fn finish(&self, job_id: &str, result: Value) -> Result<bool, QueueError> {
        let id = job_id.to_string();
        self.call("queue.finish", move |backend| {
            backend.finish(id.as_str(), &result, Utc::now())
        })
        .await
    }

    pub async fn fail(&self, job_id: &str, exc_info: String) -> Result<bool, QueueError> {
        let id = job_id.to_string();
        self.call("queue.fail", move |backend| {
            backend.fail(id.as_str(), exc_info.as_str(), Utc::now())
        })
        .await
    }

    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        self.call("queue.purge_expired", |backend| {
            let now = Utc::now();
            backend.fail_abandoned(now)?;
            backend.purge_expired(now)
        })
        .await
    }
}
