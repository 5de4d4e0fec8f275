//! Control API: the thin, one-shot operations a CLI invocation performs over
//! the store. Each function does exactly one transaction (plus, where
//! relevant, a Scheduler or Settings lookup) and returns.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use queuectl_core::{
    get_int, ConfigKey, Job, JobCounts, JobState, JobStore, NewJob, QueueError, Result, Settings,
    WorkerRecord,
};
use serde::Deserialize;
use uuid::Uuid;

pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    id: Option<String>,
    command: Option<String>,
    max_retries: Option<i64>,
}

pub async fn enqueue(store: &Arc<dyn JobStore>, json: &str) -> Result<Job> {
    let req: EnqueueRequest = serde_json::from_str(json)
        .map_err(|e| QueueError::BadInput(format!("invalid job JSON: {e}")))?;
    let command = req
        .command
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| QueueError::BadInput("\"command\" is required".to_string()))?;

    let max_retries = match req.max_retries {
        Some(v) => v,
        None => get_int(store, ConfigKey::MaxRetries).await?,
    };
    if max_retries < 0 {
        return Err(QueueError::BadInput(
            "max_retries must be non-negative".to_string(),
        ));
    }

    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = now();

    store
        .insert_job(NewJob {
            id,
            command,
            max_retries,
            next_run_at: now,
        })
        .await
}

pub async fn list(store: &Arc<dyn JobStore>, state_filter: Option<JobState>) -> Result<Vec<Job>> {
    store.list_jobs(state_filter).await
}

pub struct Status {
    pub workers: Vec<WorkerRecord>,
    pub counts: JobCounts,
}

pub async fn status(store: &Arc<dyn JobStore>) -> Result<Status> {
    let workers = store.list_workers().await?;
    let counts = store.count_by_state().await?;
    Ok(Status { workers, counts })
}

pub async fn dlq_list(store: &Arc<dyn JobStore>) -> Result<Vec<Job>> {
    store.list_jobs(Some(JobState::Dead)).await
}

pub async fn dlq_retry(store: &Arc<dyn JobStore>, id: &str) -> Result<Job> {
    store.dlq_retry(id, now()).await
}

pub async fn config_get(store: &Arc<dyn JobStore>, key: ConfigKey) -> Result<i64> {
    get_int(store, key).await
}

pub async fn config_set(store: &Arc<dyn JobStore>, key: ConfigKey, value: &str) -> Result<()> {
    queuectl_core::set_int(store, key, value).await
}

pub async fn init_db(store: &Arc<dyn JobStore>) -> Result<()> {
    store.init().await
}

pub async fn settings(store: &Arc<dyn JobStore>) -> Result<Settings> {
    Settings::load(store).await
}
