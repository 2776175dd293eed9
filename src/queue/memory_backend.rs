use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    BackendMeta, BackendStatus, QueueBackend, QueueBackendRecord, QueueError, QueueStats,
    ABANDONED_MESSAGE, ABANDON_GRACE, DEFAULT_RETENTION,
};

/// Process-local queue backend. Useful for tests and single-process setups
/// where the worker loop runs inside the same binary.
#[derive(Debug)]
pub struct InMemoryQueueBackend {
    records: Mutex<Vec<QueueBackendRecord>>,
    retention: Duration,
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl InMemoryQueueBackend {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            retention,
        }
    }

    fn records(&self) -> Result<MutexGuard<'_, Vec<QueueBackendRecord>>, QueueError> {
        self.records
            .lock()
            .map_err(|_| QueueError::Unavailable(String::from("in-memory queue lock poisoned")))
    }

    fn end_started<F>(&self, id: &str, now: DateTime<Utc>, apply: F) -> Result<bool, QueueError>
    where
        F: FnOnce(&mut QueueBackendRecord),
    {
        let mut records = self.records()?;
        match records
            .iter_mut()
            .find(|r| r.id == id && r.status == BackendStatus::Started)
        {
            Some(record) => {
                apply(record);
                record.ended_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl QueueBackend for InMemoryQueueBackend {
    fn enqueue(&self, record: QueueBackendRecord) -> Result<(), QueueError> {
        let mut records = self.records()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(QueueError::Duplicate(record.id));
        }
        records.push(record);
        Ok(())
    }

    fn fetch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError> {
        let records = self.records()?;
        Ok(records
            .iter()
            .find(|r| r.id == id && !r.is_expired(now, self.retention))
            .cloned())
    }

    fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut records = self.records()?;
        match records.iter_mut().find(|r| r.id == id && !r.status.is_ended()) {
            Some(record) => {
                record.status = BackendStatus::Canceled;
                record.ended_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_meta(&self, id: &str, meta: &BackendMeta) -> Result<bool, QueueError> {
        let mut records = self.records()?;
        match records.iter_mut().find(|r| r.id == id && !r.status.is_ended()) {
            Some(record) => {
                record.meta = meta.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueBackendRecord>, QueueError> {
        let mut records = self.records()?;
        let next = records
            .iter_mut()
            .filter(|r| r.status == BackendStatus::Queued)
            .min_by_key(|r| r.created_at);
        Ok(next.map(|record| {
            record.status = BackendStatus::Started;
            record.started_at = Some(now);
            record.clone()
        }))
    }

    fn finish(&self, id: &str, result: &Value, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.end_started(id, now, |record| {
            record.status = BackendStatus::Finished;
            record.result = Some(result.clone());
        })
    }

    fn fail(&self, id: &str, exc_info: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.end_started(id, now, |record| {
            record.status = BackendStatus::Failed;
            record.exc_info = Some(exc_info.to_string());
        })
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let records = self.records()?;
        let mut stats = QueueStats::default();
        for record in records.iter().filter(|r| !r.is_expired(now, self.retention)) {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }

    fn pending(&self, limit: usize) -> Result<Vec<QueueBackendRecord>, QueueError> {
        let records = self.records()?;
        let mut queued: Vec<QueueBackendRecord> = records
            .iter()
            .filter(|r| r.status == BackendStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|r| r.created_at);
        queued.truncate(limit);
        Ok(queued)
    }

    fn clear_failed(&self) -> Result<u64, QueueError> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|r| r.status != BackendStatus::Failed);
        Ok((before - records.len()) as u64)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|r| !r.is_expired(now, self.retention));
        Ok((before - records.len()) as u64)
    }

    fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut records = self.records()?;
        let mut failed = 0;
        for record in records.iter_mut().filter(|r| r.is_abandoned(now, ABANDON_GRACE)) {
            record.status = BackendStatus::Failed;
            record.exc_info = Some(ABANDONED_MESSAGE.to_string());
            record.ended_at = Some(now);
            failed += 1;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkUnit;

    fn record(id: &str, now: DateTime<Utc>) -> QueueBackendRecord {
        QueueBackendRecord::new(
            id,
            WorkUnit::ProcessRawCommand {
                input_files: vec![String::from("a")],
                raw_command: String::from("{input} -negate {output}"),
                output_format: String::from("png"),
                owner: None,
            },
            Duration::from_secs(60),
            now,
        )
    }

    #[test]
    fn claim_takes_oldest_first_and_only_once() {
        let backend = InMemoryQueueBackend::default();
        let now = Utc::now();
        backend.enqueue(record("job_b", now + chrono::Duration::seconds(1))).expect("enqueue");
        backend.enqueue(record("job_a", now)).expect("enqueue");

        assert_eq!(backend.claim_next(now).expect("claim").map(|r| r.id), Some(String::from("job_a")));
        assert_eq!(backend.claim_next(now).expect("claim").map(|r| r.id), Some(String::from("job_b")));
        assert!(backend.claim_next(now).expect("claim").is_none());
    }

    #[test]
    fn finish_does_not_overwrite_cancel() {
        let backend = InMemoryQueueBackend::default();
        let now = Utc::now();
        backend.enqueue(record("job_a", now)).expect("enqueue");
        backend.claim_next(now).expect("claim");
        assert!(backend.cancel("job_a", now).expect("cancel"));
        assert!(!backend.finish("job_a", &Value::Null, now).expect("finish"));
        assert!(!backend.cancel("job_a", now).expect("second cancel"));
        let fetched = backend.fetch("job_a", now).expect("fetch").expect("present");
        assert_eq!(fetched.status, BackendStatus::Canceled);
    }

    #[test]
    fn expired_records_are_hidden_then_purged() {
        let backend = InMemoryQueueBackend::new(Duration::from_secs(10));
        let now = Utc::now();
        backend.enqueue(record("job_a", now)).expect("enqueue");
        backend.claim_next(now).expect("claim");
        backend.fail("job_a", "boom", now).expect("fail");

        let later = now + chrono::Duration::seconds(11);
        assert!(backend.fetch("job_a", later).expect("fetch").is_none());
        assert_eq!(backend.stats(later).expect("stats"), QueueStats::default());
        assert_eq!(backend.purge_expired(later).expect("purge"), 1);
    }

    #[test]
    fn fail_abandoned_only_touches_overdue_started_records() {
        let backend = InMemoryQueueBackend::default();
        let now = Utc::now();
        backend.enqueue(record("job_a", now)).expect("enqueue");
        backend.enqueue(record("job_b", now + chrono::Duration::seconds(1))).expect("enqueue");
        backend.claim_next(now).expect("claim");

        assert_eq!(backend.fail_abandoned(now + chrono::Duration::seconds(300)).expect("sweep"), 0);
        let later = now + chrono::Duration::seconds(360);
        assert_eq!(backend.fail_abandoned(later).expect("sweep"), 1);

        let abandoned = backend.fetch("job_a", later).expect("fetch").expect("present");
        assert_eq!(abandoned.status, BackendStatus::Failed);
        assert_eq!(abandoned.exc_info.as_deref(), Some(ABANDONED_MESSAGE));
        let queued = backend.fetch("job_b", later).expect("fetch").expect("present");
        assert_eq!(queued.status, BackendStatus::Queued);
    }

    #[test]
    fn clear_failed_counts_removed_records() {
        let backend = InMemoryQueueBackend::default();
        let now = Utc::now();
        for id in ["job_a", "job_b", "job_c"] {
            backend.enqueue(record(id, now)).expect("enqueue");
        }
        for _ in 0..2 {
            let claimed = backend.claim_next(now).expect("claim").expect("queued");
            backend.fail(claimed.id.as_str(), "bad", now).expect("fail");
        }
        assert_eq!(backend.pending(10).expect("pending").len(), 1);
        assert_eq!(backend.clear_failed().expect("clear"), 2);
    }
}
