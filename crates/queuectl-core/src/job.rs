//! Job and worker-registration types, and the policy-light [`JobStore`] trait
//! that a durable backend must implement.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::scheduler::Decision;

/// The observable lifecycle states of a job.
///
/// The source data model also names a transient `failed` bookkeeping state;
/// it is never persisted in practice (see the scheduler module docs), so it
/// has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn all() -> [JobState; 4] {
        [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Dead,
        ]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::BadInput(format!("unknown job state: {other}"))),
        }
    }
}

/// A job as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub owner: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Caller-supplied fields for a freshly enqueued job; the store fills in the
/// remaining fields (state, attempts, timestamps) on insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    pub max_retries: i64,
    pub next_run_at: i64,
}

/// A live worker registration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub started_at: i64,
}

/// Job counts grouped by [`JobState`], as returned by `count_by_state`.
pub type JobCounts = BTreeMap<JobState, i64>;

/// The store's typed key/value configuration entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBaseSeconds,
    PollIntervalSeconds,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBaseSeconds => "backoff_base_seconds",
            ConfigKey::PollIntervalSeconds => "poll_interval_seconds",
        }
    }

    pub fn default_value(&self) -> i64 {
        match self {
            ConfigKey::MaxRetries => 3,
            ConfigKey::BackoffBaseSeconds => 2,
            ConfigKey::PollIntervalSeconds => 1,
        }
    }

    /// Non-negative for `max_retries`; strictly positive for the two timing knobs.
    pub fn validate(&self, value: i64) -> Result<()> {
        let ok = match self {
            ConfigKey::MaxRetries => value >= 0,
            ConfigKey::BackoffBaseSeconds => value > 0,
            ConfigKey::PollIntervalSeconds => value > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(QueueError::BadConfig(format!(
                "{} must be {}, got {value}",
                self.as_str(),
                if matches!(self, ConfigKey::MaxRetries) {
                    "non-negative"
                } else {
                    "positive"
                }
            )))
        }
    }
}

impl FromStr for ConfigKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max_retries" => Ok(ConfigKey::MaxRetries),
            "backoff_base_seconds" => Ok(ConfigKey::BackoffBaseSeconds),
            "poll_interval_seconds" => Ok(ConfigKey::PollIntervalSeconds),
            other => Err(QueueError::BadConfig(format!("unknown config key: {other}"))),
        }
    }
}

/// Durable, transactional persistence for jobs, config, and worker registrations.
///
/// Implementations must provide single-writer serialization for every
/// mutating operation (in particular `claim_next`, which is the one primitive
/// that must never let two callers observe the same row) while allowing reads
/// to proceed concurrently with writes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create schema idempotently.
    async fn init(&self) -> Result<()>;

    async fn insert_job(&self, job: NewJob) -> Result<Job>;

    /// Atomically claim the most eligible pending job, or return `None`.
    async fn claim_next(&self, worker_id: &str, now: i64) -> Result<Option<Job>>;

    async fn finalize_success(&self, id: &str, now: i64) -> Result<()>;

    async fn finalize_failure(
        &self,
        id: &str,
        error: &str,
        decision: Decision,
        now: i64,
    ) -> Result<()>;

    async fn list_jobs(&self, state_filter: Option<JobState>) -> Result<Vec<Job>>;

    async fn count_by_state(&self) -> Result<JobCounts>;

    async fn dlq_retry(&self, id: &str, now: i64) -> Result<Job>;

    async fn register_worker(&self, worker_id: &str, now: i64) -> Result<()>;

    async fn unregister_worker(&self, worker_id: &str) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;

    async fn get_config(&self, key: ConfigKey) -> Result<Option<String>>;

    async fn set_config(&self, key: ConfigKey, value: &str) -> Result<()>;

    /// Reset the given `processing` jobs back to `pending` in one transaction.
    /// Ids that are no longer `processing` are silently skipped, so this is
    /// safe to call with a stale candidate list.
    async fn reclaim_orphans(&self, candidate_ids: &[String], now: i64) -> Result<u64>;
}
