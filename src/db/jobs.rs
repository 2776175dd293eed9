use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::{Cancelled, Completed, Failed, Pending, Processing};

        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(rename = "operation")]
    pub operation_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing)]
    pub owner: Option<String>,
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            job_id: new_job.job_id,
            operation_kind: new_job.operation_kind,
            command: new_job.command,
            status: JobStatus::Pending,
            progress: 0,
            input_files: new_job.input_files,
            output_files: Vec::new(),
            error_message: None,
            result: None,
            owner: new_job.owner,
            parameters: new_job.parameters,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Seconds between start and completion, when both are known.
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_id: String,
    pub operation_kind: String,
    pub command: Option<String>,
    pub input_files: Vec<String>,
    pub parameters: Value,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutputArtifact {
    pub file_path: String,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputArtifact {
    pub id: String,
    pub job_id: String,
    pub owner: Option<String>,
    pub file_path: String,
    pub stored_filename: String,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// What a read-modify-write closure decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMutation {
    pub changed: bool,
    pub artifacts: Vec<NewOutputArtifact>,
}

impl JobMutation {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed() -> Self {
        Self {
            changed: true,
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdateOutcome {
    pub job: JobRecord,
    pub changed: bool,
    /// Artifact rows actually inserted; already materialized paths are skipped.
    pub materialized: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobListFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Error)]
pub enum JobsRepoError {
    #[error("job not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    #[error("stored job is corrupt: {0}")]
    Corrupt(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable job records. Every writer performs a full read-modify-write inside
/// one `BEGIN IMMEDIATE` transaction.
#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
}

impl JobStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn initialize(&self) -> Result<(), JobsRepoError> {
        self.with_connection(|_| Ok(()))
    }

    fn open(&self) -> Result<Connection, JobsRepoError> {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        Ok(conn)
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, JobsRepoError>
    where
        F: FnOnce(&Connection) -> Result<T, JobsRepoError>,
    {
        let conn = self.open()?;
        func(&conn)
    }

    fn with_connection_mut<T, F>(&self, func: F) -> Result<T, JobsRepoError>
    where
        F: FnOnce(&mut Connection) -> Result<T, JobsRepoError>,
    {
        let mut conn = self.open()?;
        func(&mut conn)
    }
}

impl JobStore {
    pub fn create_job(&self, new_job: NewJob) -> Result<JobRecord, JobsRepoError> {
        if new_job.job_id.trim().is_empty() {
            return Err(JobsRepoError::Validation(String::from(
                "Field 'job_id' is required",
            )));
        }
        let job = JobRecord::pending(new_job, Utc::now());
        self.with_connection(|conn| {
            let inserted = conn.execute(
                "
                INSERT OR IGNORE INTO jobs
                  (job_id, operation_kind, command, status, progress, input_files_json,
                   output_files_json, error_message, result_json, owner, parameters_json,
                   created_at, started_at, completed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ",
                params![
                    job.job_id,
                    job.operation_kind,
                    job.command,
                    job.status.as_str(),
                    i64::from(job.progress),
                    serde_json::to_string(&job.input_files)?,
                    serde_json::to_string(&job.output_files)?,
                    job.error_message,
                    job.result.as_ref().map(serde_json::to_string).transpose()?,
                    job.owner,
                    serde_json::to_string(&job.parameters)?,
                    ts(job.created_at),
                    job.started_at.map(ts),
                    job.completed_at.map(ts),
                ],
            )?;
            if inserted == 0 {
                return Err(JobsRepoError::Validation(format!(
                    "Job '{}' already exists",
                    job.job_id
                )));
            }
            Ok(())
        })?;
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobRecord, JobsRepoError> {
        self.with_connection(|conn| load_job(conn, job_id)?.ok_or(JobsRepoError::NotFound))
    }

    pub fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<JobRecord>, JobsRepoError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT * FROM jobs
                WHERE (?1 IS NULL OR owner = ?1)
                  AND (?2 IS NULL OR status = ?2)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?3
                ",
            )?;
            let limit = filter
                .limit
                .map(|v| i64::try_from(v).unwrap_or(i64::MAX))
                .unwrap_or(-1);
            let rows = stmt
                .query_map(
                    params![filter.owner, filter.status.map(JobStatus::as_str), limit],
                    read_job_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(JobRow::into_record).collect()
        })
    }

    pub fn list_active_jobs(&self) -> Result<Vec<JobRecord>, JobsRepoError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT * FROM jobs
                WHERE status IN ('pending', 'processing')
                ORDER BY created_at ASC, rowid ASC
                ",
            )?;
            let rows = stmt
                .query_map([], read_job_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(JobRow::into_record).collect()
        })
    }

    /// Re-reads the job inside an immediate transaction, lets `mutate` decide,
    /// and writes the whole record back when it reports a change.
    pub fn update_job<F>(&self, job_id: &str, mutate: F) -> Result<JobUpdateOutcome, JobsRepoError>
    where
        F: FnOnce(&mut JobRecord) -> JobMutation,
    {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = load_job(&tx, job_id)?.ok_or(JobsRepoError::NotFound)?;
            let mutation = mutate(&mut job);
            if !mutation.changed && mutation.artifacts.is_empty() {
                return Ok(JobUpdateOutcome {
                    job,
                    changed: false,
                    materialized: 0,
                });
            }

            if mutation.changed {
                write_job(&tx, &job)?;
            }
            let now = Utc::now();
            let mut materialized = 0;
            for artifact in &mutation.artifacts {
                materialized += insert_artifact(&tx, &job, artifact, now)?;
            }
            tx.commit()?;
            Ok(JobUpdateOutcome {
                job,
                changed: mutation.changed,
                materialized,
            })
        })
    }

    pub fn list_artifacts(&self, job_id: &str) -> Result<Vec<OutputArtifact>, JobsRepoError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT * FROM output_artifacts
                WHERE job_id = ?1
                ORDER BY created_at ASC, rowid ASC
                ",
            )?;
            let rows = stmt
                .query_map([job_id], row_to_artifact)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), JobsRepoError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
          job_id TEXT PRIMARY KEY,
          operation_kind TEXT NOT NULL,
          command TEXT,
          status TEXT NOT NULL,
          progress INTEGER NOT NULL DEFAULT 0,
          input_files_json TEXT NOT NULL DEFAULT '[]',
          output_files_json TEXT NOT NULL DEFAULT '[]',
          error_message TEXT,
          result_json TEXT,
          owner TEXT,
          parameters_json TEXT NOT NULL DEFAULT '{}',
          created_at TEXT NOT NULL,
          started_at TEXT,
          completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_owner_created ON jobs(owner, created_at);

        CREATE TABLE IF NOT EXISTS output_artifacts (
          id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
          owner TEXT,
          file_path TEXT NOT NULL UNIQUE,
          stored_filename TEXT NOT NULL,
          original_filename TEXT,
          mime_type TEXT,
          file_size INTEGER,
          created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_output_artifacts_job ON output_artifacts(job_id);
        ",
    )?;
    Ok(())
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, JobsRepoError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| JobsRepoError::Corrupt(format!("timestamp '{value}': {error}")))
}

struct JobRow {
    job_id: String,
    operation_kind: String,
    command: Option<String>,
    status: String,
    progress: i64,
    input_files_json: String,
    output_files_json: String,
    error_message: Option<String>,
    result_json: Option<String>,
    owner: Option<String>,
    parameters_json: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get("job_id")?,
        operation_kind: row.get("operation_kind")?,
        command: row.get("command")?,
        status: row.get("status")?,
        progress: row.get("progress")?,
        input_files_json: row.get("input_files_json")?,
        output_files_json: row.get("output_files_json")?,
        error_message: row.get("error_message")?,
        result_json: row.get("result_json")?,
        owner: row.get("owner")?,
        parameters_json: row.get("parameters_json")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord, JobsRepoError> {
        let status = JobStatus::parse(self.status.as_str())
            .ok_or_else(|| JobsRepoError::Corrupt(format!("status '{}'", self.status)))?;
        Ok(JobRecord {
            job_id: self.job_id,
            operation_kind: self.operation_kind,
            command: self.command,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            input_files: serde_json::from_str(self.input_files_json.as_str())?,
            output_files: serde_json::from_str(self.output_files_json.as_str())?,
            error_message: self.error_message,
            result: self
                .result_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            owner: self.owner,
            parameters: serde_json::from_str(self.parameters_json.as_str())?,
            created_at: parse_ts(self.created_at.as_str())?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<JobRecord>, JobsRepoError> {
    conn.query_row("SELECT * FROM jobs WHERE job_id = ?1", [job_id], read_job_row)
        .optional()?
        .map(JobRow::into_record)
        .transpose()
}

fn write_job(conn: &Connection, job: &JobRecord) -> Result<(), JobsRepoError> {
    conn.execute(
        "
        UPDATE jobs
        SET status = ?2, progress = ?3, output_files_json = ?4, error_message = ?5,
            result_json = ?6, started_at = ?7, completed_at = ?8, command = ?9
        WHERE job_id = ?1
        ",
        params![
            job.job_id,
            job.status.as_str(),
            i64::from(job.progress),
            serde_json::to_string(&job.output_files)?,
            job.error_message,
            job.result.as_ref().map(serde_json::to_string).transpose()?,
            job.started_at.map(ts),
            job.completed_at.map(ts),
            job.command,
        ],
    )?;
    Ok(())
}

fn insert_artifact(
    conn: &Connection,
    job: &JobRecord,
    artifact: &NewOutputArtifact,
    now: DateTime<Utc>,
) -> Result<usize, JobsRepoError> {
    let stored_filename = Path::new(artifact.file_path.as_str())
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| artifact.file_path.clone());
    let inserted = conn.execute(
        "
        INSERT OR IGNORE INTO output_artifacts
          (id, job_id, owner, file_path, stored_filename, original_filename, mime_type,
           file_size, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
        params![
            Uuid::new_v4().to_string(),
            job.job_id,
            job.owner,
            artifact.file_path,
            stored_filename,
            artifact.original_filename,
            artifact.mime_type,
            artifact.file_size.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
            ts(now),
        ],
    )?;
    Ok(inserted)
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutputArtifact> {
    let created_at: String = row.get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(created_at.as_str())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })?;
    Ok(OutputArtifact {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        owner: row.get("owner")?,
        file_path: row.get("file_path")?,
        stored_filename: row.get("stored_filename")?,
        original_filename: row.get("original_filename")?,
        mime_type: row.get("mime_type")?,
        file_size: row
            .get::<_, Option<i64>>("file_size")?
            .and_then(|v| u64::try_from(v).ok()),
        created_at,
    })
}
