//! SQLite implementation of the `queuectl` job store.
//!
//! # Database schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL,              -- pending | processing | completed | dead
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL,
//!     next_run_at INTEGER NOT NULL,
//!     last_error TEXT,
//!     owner TEXT,
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL
//! );
//! CREATE INDEX idx_jobs_claim ON jobs (state, next_run_at, created_at, id);
//!
//! CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//!
//! CREATE TABLE workers (worker_id TEXT PRIMARY KEY, started_at INTEGER NOT NULL);
//! ```
//!
//! # Concurrency
//!
//! Claims and finalizations take an explicit `BEGIN IMMEDIATE` so the write
//! lock is acquired up front, rather than relying on SQLite's deferred-lock
//! upgrade (which is exactly the race a single-claim primitive must not have).
//! `busy_timeout` is set on every pooled connection so brief contention
//! between concurrent worker processes resolves with a short wait instead of
//! an immediate `SQLITE_BUSY` error.

use std::path::Path;

use async_trait::async_trait;
use queuectl_core::{
    ConfigKey, Decision, Job, JobCounts, JobState, JobStore, NewJob, QueueError, Result,
    WorkerRecord,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, SqlitePool};
use std::str::FromStr;

const LAST_ERROR_MAX_LEN: usize = 4096;

fn store_err(e: sqlx::Error) -> QueueError {
    QueueError::Store(e.to_string())
}

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the store at `db_path`.
    pub async fn connect(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::Store(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("PRAGMA busy_timeout = 5000;").await?;
                    conn.execute("PRAGMA foreign_keys = ON;").await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(store_err)?;

        Ok(Self { pool })
    }

    /// Open an in-memory store (for tests). A dedicated single connection is
    /// used so the in-memory database isn't lost between pool connections.
    pub async fn connect_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(store_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        Ok(Self { pool })
    }

    fn truncate_error(error: &str) -> String {
        if error.len() <= LAST_ERROR_MAX_LEN {
            error.to_string()
        } else {
            let mut truncated = error[..LAST_ERROR_MAX_LEN].to_string();
            truncated.push_str("... (truncated)");
            truncated
        }
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let state_str: String = row.try_get("state").map_err(store_err)?;
    Ok(Job {
        id: row.try_get("id").map_err(store_err)?,
        command: row.try_get("command").map_err(store_err)?,
        state: JobState::from_str(&state_str)?,
        attempts: row.try_get("attempts").map_err(store_err)?,
        max_retries: row.try_get("max_retries").map_err(store_err)?,
        next_run_at: row.try_get("next_run_at").map_err(store_err)?,
        last_error: row.try_get("last_error").map_err(store_err)?,
        owner: row.try_get("owner").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
    })
}

const JOB_COLUMNS: &str =
    "id, command, state, attempts, max_retries, next_run_at, last_error, owner, created_at, updated_at";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;

        conn.execute("PRAGMA journal_mode = WAL;")
            .await
            .map_err(store_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                next_run_at INTEGER NOT NULL,
                last_error TEXT,
                owner TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .await
        .map_err(store_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, next_run_at, created_at, id);",
        )
        .await
        .map_err(store_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .await
        .map_err(store_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL
            );",
        )
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        let now = job.next_run_at;

        let existing = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(&job.id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;
        if existing.is_some() {
            return Err(QueueError::DuplicateId(job.id));
        }

        sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, next_run_at, last_error, owner, created_at, updated_at)
             VALUES (?, ?, 'pending', 0, ?, ?, NULL, NULL, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.max_retries)
        .bind(job.next_run_at)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(&job.id)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_err)?;
        row_to_job(&row)
    }

    async fn claim_next(&self, worker_id: &str, now: i64) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN IMMEDIATE;").await.map_err(store_err)?;

        let candidate = sqlx::query(
            "SELECT id FROM jobs
             WHERE state = 'pending' AND next_run_at <= ?
             ORDER BY next_run_at ASC, created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_err)?;

        let Some(candidate) = candidate else {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Ok(None);
        };
        let id: String = candidate.try_get("id").map_err(store_err)?;

        sqlx::query("UPDATE jobs SET state = 'processing', owner = ?, updated_at = ? WHERE id = ?")
            .bind(worker_id)
            .bind(now)
            .bind(&id)
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(&id)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_err)?;
        let job = row_to_job(&row)?;

        conn.execute("COMMIT;").await.map_err(store_err)?;
        Ok(Some(job))
    }

    async fn finalize_success(&self, id: &str, now: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN IMMEDIATE;").await.map_err(store_err)?;

        let current = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;
        let Some(current) = current else {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Err(QueueError::NotFound(id.to_string()));
        };
        let state: String = current.try_get("state").map_err(store_err)?;
        if state != "processing" {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Err(QueueError::BadInput(format!(
                "job {id} is not processing (state={state})"
            )));
        }

        sqlx::query(
            "UPDATE jobs
             SET state = 'completed', owner = NULL, attempts = attempts + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;

        conn.execute("COMMIT;").await.map_err(store_err)?;
        Ok(())
    }

    async fn finalize_failure(
        &self,
        id: &str,
        error: &str,
        decision: Decision,
        now: i64,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN IMMEDIATE;").await.map_err(store_err)?;

        let current = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;
        let Some(current) = current else {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Err(QueueError::NotFound(id.to_string()));
        };
        let state: String = current.try_get("state").map_err(store_err)?;
        if state != "processing" {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Err(QueueError::BadInput(format!(
                "job {id} is not processing (state={state})"
            )));
        }

        let truncated = SqliteJobStore::truncate_error(error);

        match decision {
            Decision::Retry { delay_seconds } => {
                sqlx::query(
                    "UPDATE jobs
                     SET state = 'pending', owner = NULL, attempts = attempts + 1,
                         next_run_at = ?, last_error = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(now + delay_seconds)
                .bind(&truncated)
                .bind(now)
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(store_err)?;
            }
            Decision::Dead => {
                sqlx::query(
                    "UPDATE jobs
                     SET state = 'dead', owner = NULL, attempts = attempts + 1,
                         next_run_at = ?, last_error = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(now)
                .bind(&truncated)
                .bind(now)
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(store_err)?;
            }
        }

        conn.execute("COMMIT;").await.map_err(store_err)?;
        Ok(())
    }

    async fn list_jobs(&self, state_filter: Option<JobState>) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;

        let rows = if let Some(state) = state_filter {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ? ORDER BY next_run_at ASC, created_at ASC, id ASC"
            ))
            .bind(state.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(store_err)?
        } else {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY state ASC, next_run_at ASC, created_at ASC, id ASC"
            ))
            .fetch_all(&mut *conn)
            .await
            .map_err(store_err)?
        };

        rows.iter().map(row_to_job).collect()
    }

    async fn count_by_state(&self) -> Result<JobCounts> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        let rows = sqlx::query("SELECT state, COUNT(*) as cnt FROM jobs GROUP BY state")
            .fetch_all(&mut *conn)
            .await
            .map_err(store_err)?;

        let mut counts: JobCounts = JobState::all().into_iter().map(|s| (s, 0)).collect();
        for row in rows {
            let state_str: String = row.try_get("state").map_err(store_err)?;
            let cnt: i64 = row.try_get("cnt").map_err(store_err)?;
            counts.insert(JobState::from_str(&state_str)?, cnt);
        }
        Ok(counts)
    }

    async fn dlq_retry(&self, id: &str, now: i64) -> Result<Job> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN IMMEDIATE;").await.map_err(store_err)?;

        let current = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;
        let Some(current) = current else {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Err(QueueError::NotFound(id.to_string()));
        };
        let state: String = current.try_get("state").map_err(store_err)?;
        if state != "dead" {
            conn.execute("ROLLBACK;").await.map_err(store_err)?;
            return Err(QueueError::NotInDlq(id.to_string()));
        }

        sqlx::query(
            "UPDATE jobs
             SET state = 'pending', attempts = 0, owner = NULL, next_run_at = ?, last_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_err)?;
        let job = row_to_job(&row)?;

        conn.execute("COMMIT;").await.map_err(store_err)?;
        Ok(job)
    }

    async fn register_worker(&self, worker_id: &str, now: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        sqlx::query(
            "INSERT INTO workers (worker_id, started_at) VALUES (?, ?)
             ON CONFLICT(worker_id) DO UPDATE SET started_at = excluded.started_at",
        )
        .bind(worker_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        sqlx::query("DELETE FROM workers WHERE worker_id = ?")
            .bind(worker_id)
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        let rows = sqlx::query("SELECT worker_id, started_at FROM workers ORDER BY worker_id ASC")
            .fetch_all(&mut *conn)
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                Ok(WorkerRecord {
                    worker_id: row.try_get("worker_id").map_err(store_err)?,
                    started_at: row.try_get("started_at").map_err(store_err)?,
                })
            })
            .collect()
    }

    async fn get_config(&self, key: ConfigKey) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => Ok(Some(row.try_get("value").map_err(store_err)?)),
            None => Ok(None),
        }
    }

    async fn set_config(&self, key: ConfigKey, value: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key.as_str())
        .bind(value)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn reclaim_orphans(&self, candidate_ids: &[String], now: i64) -> Result<u64> {
        if candidate_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        conn.execute("BEGIN IMMEDIATE;").await.map_err(store_err)?;

        let placeholders = candidate_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE jobs SET state = 'pending', owner = NULL, updated_at = ?
             WHERE state = 'processing' AND id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(now);
        for id in candidate_ids {
            query = query.bind(id);
        }
        let result = query.execute(&mut *conn).await.map_err(store_err)?;

        conn.execute("COMMIT;").await.map_err(store_err)?;
        Ok(result.rows_affected())
    }
}

fn _assert_send_sync()
where
    SqliteJobStore: Send + Sync,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteJobStore {
        let store = SqliteJobStore::connect_memory().await.expect("connect");
        store.init().await.expect("init");
        store
    }

    fn new_job(id: &str, now: i64) -> NewJob {
        NewJob {
            id: id.to_string(),
            command: "true".to_string(),
            max_retries: 3,
            next_run_at: now,
        }
    }

    #[tokio::test]
    async fn insert_then_claim_transitions_to_processing() {
        let store = store().await;
        store.insert_job(new_job("a", 100)).await.unwrap();

        let claimed = store.claim_next("worker-1", 100).await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.owner.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn claim_respects_eligibility_gate() {
        let store = store().await;
        store.insert_job(new_job("future", 1_000)).await.unwrap();

        assert!(store.claim_next("w", 500).await.unwrap().is_none());
        assert!(store.claim_next("w", 1_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let store = store().await;
        store.insert_job(new_job("dup", 0)).await.unwrap();
        let err = store.insert_job(new_job("dup", 0)).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn tie_break_order_is_next_run_then_created_then_id() {
        let store = store().await;
        store.insert_job(new_job("b", 0)).await.unwrap();
        store.insert_job(new_job("a", 0)).await.unwrap();

        let claimed = store.claim_next("w", 0).await.unwrap().unwrap();
        assert_eq!(claimed.id, "a", "lexicographic id tie-break at equal next_run_at/created_at");
    }

    #[tokio::test]
    async fn finalize_success_marks_completed() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();
        store.claim_next("w", 0).await.unwrap();
        store.finalize_success("a", 10).await.unwrap();

        let job = store.list_jobs(Some(JobState::Completed)).await.unwrap();
        assert_eq!(job.len(), 1);
        assert_eq!(job[0].attempts, 1);
        assert!(job[0].owner.is_none());
    }

    #[tokio::test]
    async fn finalize_failure_retry_reschedules_with_delay() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();
        store.claim_next("w", 0).await.unwrap();
        store
            .finalize_failure("a", "boom", Decision::Retry { delay_seconds: 5 }, 10)
            .await
            .unwrap();

        let jobs = store.list_jobs(Some(JobState::Pending)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].next_run_at, 15);
        assert_eq!(jobs[0].last_error.as_deref(), Some("boom"));
        assert_eq!(jobs[0].attempts, 1);
    }

    #[tokio::test]
    async fn finalize_failure_dead_sets_dead_state() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();
        store.claim_next("w", 0).await.unwrap();
        store
            .finalize_failure("a", "boom", Decision::Dead, 10)
            .await
            .unwrap();

        let jobs = store.list_jobs(Some(JobState::Dead)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempts, 1);
    }

    #[tokio::test]
    async fn dlq_retry_resets_attempts_and_clears_error() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();
        store.claim_next("w", 0).await.unwrap();
        store
            .finalize_failure("a", "boom", Decision::Dead, 10)
            .await
            .unwrap();

        let job = store.dlq_retry("a", 20).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn dlq_retry_rejects_non_dead_job() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();
        let err = store.dlq_retry("a", 0).await.unwrap_err();
        assert!(matches!(err, QueueError::NotInDlq(_)));
    }

    #[tokio::test]
    async fn config_round_trips_and_defaults_are_absent_until_set() {
        let store = store().await;
        assert_eq!(store.get_config(ConfigKey::MaxRetries).await.unwrap(), None);

        store.set_config(ConfigKey::MaxRetries, "5").await.unwrap();
        assert_eq!(
            store.get_config(ConfigKey::MaxRetries).await.unwrap(),
            Some("5".to_string())
        );
    }

    #[tokio::test]
    async fn worker_registration_round_trips() {
        let store = store().await;
        store.register_worker("123", 0).await.unwrap();
        assert_eq!(store.list_workers().await.unwrap().len(), 1);

        store.unregister_worker("123").await.unwrap();
        assert!(store.list_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_orphans_resets_only_processing_candidates() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();
        store.insert_job(new_job("b", 0)).await.unwrap();
        store.claim_next("dead-worker", 0).await.unwrap(); // claims "a"

        let reclaimed = store
            .reclaim_orphans(&["a".to_string(), "b".to_string()], 50)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1, "b was never processing, so it's untouched");

        let jobs = store.list_jobs(Some(JobState::Pending)).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.owner.is_none()));
    }

    #[tokio::test]
    async fn count_by_state_covers_all_states() {
        let store = store().await;
        store.insert_job(new_job("a", 0)).await.unwrap();

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&JobState::Pending], 1);
        assert_eq!(counts[&JobState::Completed], 0);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = store().await;
        store.init().await.unwrap();
        store.insert_job(new_job("a", 0)).await.unwrap();
        store.init().await.unwrap();

        assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
    }
}
