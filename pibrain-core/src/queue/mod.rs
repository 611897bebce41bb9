//! The job queue: a SQLite-backed FIFO-by-priority queue with optimistic
//! claim semantics (SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`).

use crate::db::StorageEngine;
use crate::error::{ClassifiedError, Error, Result};
use crate::ids::generate_job_id;
use crate::types::{Job, JobStatus, JobType, NewJob};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

pub struct JobQueue<'a> {
    engine: &'a StorageEngine,
}

impl<'a> JobQueue<'a> {
    pub fn new(engine: &'a StorageEngine) -> Self {
        JobQueue { engine }
    }

    pub fn enqueue(&self, job: NewJob) -> Result<String> {
        let id = generate_job_id();
        let priority = job.priority.unwrap_or_else(|| job.job_type.default_priority());
        let max_retries = job.max_retries.unwrap_or(5);
        let conn = self.engine.connection();
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, priority, payload, retry_count, max_retries, queued_at, available_at, last_error)
             VALUES (?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6, NULL, NULL)",
            params![
                id,
                job.job_type.as_str(),
                priority,
                job.payload.to_string(),
                max_retries,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<String>> {
        jobs.into_iter().map(|job| self.enqueue(job)).collect()
    }

    /// Claims the highest-priority eligible pending job. Retries the
    /// select-then-conditional-update loop if another worker wins the race;
    /// this is SQLite's substitute for `SELECT ... FOR UPDATE SKIP LOCKED`.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        loop {
            let candidate: Option<String> = {
                let conn = self.engine.connection();
                conn.query_row(
                    "SELECT id FROM jobs
                     WHERE status = 'pending' AND (available_at IS NULL OR available_at <= ?1)
                     ORDER BY priority ASC, queued_at ASC
                     LIMIT 1",
                    params![Utc::now().to_rfc3339()],
                    |row| row.get(0),
                )
                .optional()?
            };

            let Some(id) = candidate else { return Ok(None) };

            let claimed = {
                let conn = self.engine.connection();
                conn.execute(
                    "UPDATE jobs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                    params![id],
                )?
            };

            if claimed == 0 {
                continue;
            }

            return self.get_job(&id);
        }
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.engine.connection();
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .map_err(Error::from)
    }

    pub fn complete(&self, id: &str) -> Result<()> {
        let conn = self.engine.connection();
        conn.execute("UPDATE jobs SET status = 'completed' WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Marks a job failed; if the classified error is retryable and under
    /// the job's retry bound, requeues it with an exponential backoff delay
    /// instead of marking it terminal.
    pub fn fail(&self, id: &str, error: &ClassifiedError, policy: &crate::error::RetryPolicy) -> Result<()> {
        let job = self.get_job(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        let line = error.to_stored_line(Utc::now());

        if error.should_retry(job.retry_count, job.max_retries) {
            let delay_secs = crate::error::calculate_retry_delay_secs(job.retry_count, policy, 0.0);
            let available_at = Utc::now() + chrono::Duration::seconds(delay_secs as i64);
            let conn = self.engine.connection();
            conn.execute(
                "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1, available_at = ?2, last_error = ?3 WHERE id = ?1",
                params![id, available_at.to_rfc3339(), line],
            )?;
        } else {
            let conn = self.engine.connection();
            conn.execute(
                "UPDATE jobs SET status = 'failed', last_error = ?2 WHERE id = ?1",
                params![id, line],
            )?;
        }
        Ok(())
    }

    pub fn get_job_counts(&self) -> Result<HashMap<JobStatus, i64>> {
        let conn = self.engine.connection();
        let mut stmt = conn.prepare("SELECT status, count(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = status.parse::<JobStatus>() {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }

    pub fn get_stats(&self) -> Result<QueueStats> {
        let counts = self.get_job_counts()?;
        Ok(QueueStats {
            pending: counts.get(&JobStatus::Pending).copied().unwrap_or(0),
            running: counts.get(&JobStatus::Running).copied().unwrap_or(0),
            completed: counts.get(&JobStatus::Completed).copied().unwrap_or(0),
            failed: counts.get(&JobStatus::Failed).copied().unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let job_type: String = row.get("job_type")?;
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    let queued_at: String = row.get("queued_at")?;
    let available_at: Option<String> = row.get("available_at")?;

    Ok(Job {
        id: row.get("id")?,
        job_type: job_type.parse().unwrap_or(JobType::Initial),
        status: status.parse().unwrap_or(JobStatus::Pending),
        priority: row.get("priority")?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        queued_at: chrono::DateTime::parse_from_rfc3339(&queued_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        available_at: available_at.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc))
        }),
        last_error: row.get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryPolicy;

    fn new_job() -> NewJob {
        NewJob {
            job_type: JobType::Initial,
            priority: None,
            payload: serde_json::json!({"sessionFile": "a.jsonl"}),
            max_retries: Some(2),
        }
    }

    #[test]
    fn claim_is_single_winner_under_contention() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let queue = JobQueue::new(&engine);
        queue.enqueue(new_job()).unwrap();

        let first = queue.claim_next().unwrap();
        let second = queue.claim_next().unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn priority_orders_initial_before_backfill() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let queue = JobQueue::new(&engine);
        queue
            .enqueue(NewJob { job_type: JobType::Backfill, priority: None, payload: serde_json::json!({}), max_retries: None })
            .unwrap();
        queue.enqueue(new_job()).unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.job_type, JobType::Initial);
    }

    #[test]
    fn fail_requeues_transient_errors_until_retry_bound() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let queue = JobQueue::new(&engine);
        let id = queue.enqueue(new_job()).unwrap();
        let job = queue.claim_next().unwrap().unwrap();
        assert_eq!(job.id, id);

        let err = ClassifiedError::transient(crate::error::Reason::NETWORK, "connection reset");
        queue.fail(&id, &err, &RetryPolicy::default()).unwrap();

        let updated = queue.get_job(&id).unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Pending);
        assert_eq!(updated.retry_count, 1);
    }

    #[test]
    fn fail_terminates_permanent_errors_immediately() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let queue = JobQueue::new(&engine);
        let id = queue.enqueue(new_job()).unwrap();
        queue.claim_next().unwrap();

        let err = ClassifiedError::permanent(crate::error::Reason::VALIDATION, "bad payload");
        queue.fail(&id, &err, &RetryPolicy::default()).unwrap();

        let updated = queue.get_job(&id).unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
    }
}
