use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::warn;

use super::{
    BackendMeta, BackendStatus, QueueBackend, QueueBackendRecord, QueueError, QueueStats,
    ABANDONED_MESSAGE, ABANDON_GRACE, DEFAULT_RETENTION,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "id, status, work_json, result_json, meta_json, created_at, started_at, ended_at, exc_info, timeout_secs";

/// Durable queue shared between the request process and worker processes
/// through one SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    db_path: PathBuf,
    retention: Duration,
}

impl SqliteQueueBackend {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self::with_retention(db_path, DEFAULT_RETENTION)
    }

    pub fn with_retention(db_path: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            retention,
        }
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn initialize(&self) -> Result<(), QueueError> {
        self.with_connection(|_| Ok(()))
    }

    fn open(&self) -> Result<Connection, QueueError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                QueueError::Unavailable(format!("{}: {error}", parent.display()))
            })?;
        }
        let conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&conn)?;
        Ok(conn)
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, QueueError>
    where
        F: FnOnce(&Connection) -> Result<T, QueueError>,
    {
        let conn = self.open()?;
        func(&conn)
    }

    fn with_connection_mut<T, F>(&self, func: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut Connection) -> Result<T, QueueError>,
    {
        let mut conn = self.open()?;
        func(&mut conn)
    }

    fn expires_at(&self, ended: DateTime<Utc>) -> Option<String> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .map(|window| ts(ended + window))
    }

    fn end_started(
        &self,
        id: &str,
        status: BackendStatus,
        result: Option<&Value>,
        exc_info: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result_json = result.map(serde_json::to_string).transpose()?;
        self.with_connection(|conn| {
            let changed = conn.execute(
                "
                UPDATE queue_jobs
                SET status = ?2, result_json = COALESCE(?3, result_json),
                    exc_info = COALESCE(?4, exc_info), ended_at = ?5, expires_at = ?6
                WHERE id = ?1 AND status = 'started'
                ",
                params![
                    id,
                    status.as_str(),
                    result_json,
                    exc_info,
                    ts(now),
                    self.expires_at(now)
                ],
            )?;
            Ok(changed > 0)
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_jobs (
          id TEXT PRIMARY KEY,
          status TEXT NOT NULL,
          work_json TEXT NOT NULL,
          result_json TEXT,
          meta_json TEXT NOT NULL DEFAULT '{}',
          created_at TEXT NOT NULL,
          started_at TEXT,
          ended_at TEXT,
          expires_at TEXT,
          exc_info TEXT,
          timeout_secs INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_jobs_status_created
          ON queue_jobs(status, created_at);
        ",
    )?;
    Ok(())
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| QueueError::Corrupt(format!("timestamp '{value}': {error}")))
}

struct QueueRow {
    id: String,
    status: String,
    work_json: String,
    result_json: Option<String>,
    meta_json: String,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    exc_info: Option<String>,
    timeout_secs: i64,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get("id")?,
        status: row.get("status")?,
        work_json: row.get("work_json")?,
        result_json: row.get("result_json")?,
        meta_json: row.get("meta_json")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        exc_info: row.get("exc_info")?,
        timeout_secs: row.get("timeout_secs")?,
    })
}

impl QueueRow {
    fn into_record(self) -> Result<QueueBackendRecord, QueueError> {
        let status = BackendStatus::parse(self.status.as_str())
            .ok_or_else(|| QueueError::Corrupt(format!("status '{}'", self.status)))?;
        Ok(QueueBackendRecord {
            status,
            work: serde_json::from_str(self.work_json.as_str())?,
            result: self
                .result_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            meta: serde_json::from_str::<BackendMeta>(self.meta_json.as_str())?,
            created_at: parse_ts(self.created_at.as_str())?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            exc_info: self.exc_info,
            timeout_secs: u64::try_from(self.timeout_secs).unwrap_or(1),
            id: self.id,
        })
    }
}

impl QueueBackend for SqliteQueueBackend {
    fn enqueue(&self, record: QueueBackendRecord) -> Result<(), QueueError> {
        let work_json = serde_json::to_string(&record.work)?;
        let meta_json = serde_json::to_string(&record.meta)?;
        self.with_connection(|conn| {
            let inserted = conn.execute(
                "
                INSERT OR IGNORE INTO queue_jobs
                  (id, status, work_json, meta_json, created_at, timeout_secs)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    record.id,
                    record.status.as_str(),
                    work_json,
                    meta_json,
                    ts(record.created_at),
                    i64::try_from(record.timeout_secs).unwrap_or(i64::MAX)
                ],
            )?;
            if inserted == 0 {
                return Err(QueueError::Duplicate(record.id.clone()));
            }
            Ok(())
        })
    }

    fn fetch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    format!(
                        "SELECT {SELECT_COLUMNS} FROM queue_jobs
                         WHERE id = ?1 AND (expires_at IS NULL OR expires_at > ?2)"
                    )
                    .as_str(),
                    params![id, ts(now)],
                    read_row,
                )
                .optional()?;
            row.map(QueueRow::into_record).transpose()
        })
    }

    fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "
                UPDATE queue_jobs
                SET status = 'canceled', ended_at = ?2, expires_at = ?3
                WHERE id = ?1 AND status IN ('queued', 'started')
                ",
                params![id, ts(now), self.expires_at(now)],
            )?;
            Ok(changed > 0)
        })
    }

    fn set_meta(&self, id: &str, meta: &BackendMeta) -> Result<bool, QueueError> {
        let meta_json = serde_json::to_string(meta)?;
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE queue_jobs SET meta_json = ?2 WHERE id = ?1 AND status IN ('queued', 'started')",
                params![id, meta_json],
            )?;
            Ok(changed > 0)
        })
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError> {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let claimed = loop {
                let row = tx
                    .query_row(
                        format!(
                            "SELECT {SELECT_COLUMNS} FROM queue_jobs
                             WHERE status = 'queued'
                             ORDER BY created_at ASC, rowid ASC
                             LIMIT 1"
                        )
                        .as_str(),
                        [],
                        read_row,
                    )
                    .optional()?;
                let Some(row) = row else {
                    break None;
                };
                let id = row.id.clone();
                match row.into_record() {
                    Ok(mut record) => {
                        tx.execute(
                            "UPDATE queue_jobs SET status = 'started', started_at = ?2 WHERE id = ?1",
                            params![id, ts(now)],
                        )?;
                        record.status = BackendStatus::Started;
                        record.started_at = Some(now);
                        break Some(record);
                    }
                    Err(error) => {
                        warn!(job_id = %id, error = %error, "failing unreadable queue record");
                        tx.execute(
                            "
                            UPDATE queue_jobs
                            SET status = 'failed', exc_info = ?2, ended_at = ?3, expires_at = ?4
                            WHERE id = ?1
                            ",
                            params![
                                id,
                                format!("Corrupt queue record: {error}"),
                                ts(now),
                                self.expires_at(now)
                            ],
                        )?;
                    }
                }
            };
            tx.commit()?;
            Ok(claimed)
        })
    }

    fn finish(&self, id: &str, result: &Value, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.end_started(id, BackendStatus::Finished, Some(result), None, now)
    }

    fn fail(&self, id: &str, exc_info: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.end_started(id, BackendStatus::Failed, None, Some(exc_info), now)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT status, COUNT(*) AS total FROM queue_jobs
                WHERE expires_at IS NULL OR expires_at > ?1
                GROUP BY status
                ",
            )?;
            let mut rows = stmt.query(params![ts(now)])?;
            let mut stats = QueueStats::default();
            while let Some(row) = rows.next()? {
                let status: String = row.get("status")?;
                let total: i64 = row.get("total")?;
                if let Some(status) = BackendStatus::parse(status.as_str()) {
                    stats.add(status, u64::try_from(total).unwrap_or(0));
                }
            }
            Ok(stats)
        })
    }

    fn pending(&self, limit: usize) -> Result<Vec<QueueBackendRecord>, QueueError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                format!(
                    "SELECT {SELECT_COLUMNS} FROM queue_jobs
                     WHERE status = 'queued'
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT ?1"
                )
                .as_str(),
            )?;
            let rows = stmt
                .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(QueueRow::into_record).collect()
        })
    }

    fn clear_failed(&self) -> Result<u64, QueueError> {
        self.with_connection(|conn| {
            let removed = conn.execute("DELETE FROM queue_jobs WHERE status = 'failed'", [])?;
            Ok(removed as u64)
        })
    }

    fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let overdue = {
                let mut stmt = tx.prepare(
                    "SELECT id, started_at, timeout_secs FROM queue_jobs WHERE status = 'started'",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>("id")?,
                            row.get::<_, Option<String>>("started_at")?,
                            row.get::<_, i64>("timeout_secs")?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let grace = chrono::Duration::from_std(ABANDON_GRACE)
                    .map_err(|error| QueueError::Corrupt(error.to_string()))?;
                let mut overdue = Vec::new();
                for (id, started_at, timeout_secs) in rows {
                    let Some(started_at) = started_at else {
                        continue;
                    };
                    let deadline = parse_ts(started_at.as_str())?
                        + chrono::Duration::seconds(timeout_secs.max(0))
                        + grace;
                    if deadline <= now {
                        overdue.push(id);
                    }
                }
                overdue
            };

            let mut failed = 0u64;
            for id in overdue {
                failed += tx.execute(
                    "
                    UPDATE queue_jobs
                    SET status = 'failed', exc_info = ?2, ended_at = ?3, expires_at = ?4
                    WHERE id = ?1 AND status = 'started'
                    ",
                    params![id, ABANDONED_MESSAGE, ts(now), self.expires_at(now)],
                )? as u64;
            }
            tx.commit()?;
            Ok(failed)
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        self.with_connection(|conn| {
            let removed = conn.execute(
                "DELETE FROM queue_jobs WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![ts(now)],
            )?;
            Ok(removed as u64)
        })
    }
}
