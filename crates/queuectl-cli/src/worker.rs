//! The worker runtime: poll, claim, execute, finalize, until a graceful
//! shutdown is requested. A worker that has already claimed a job always
//! finishes it (executes and finalizes) before exiting.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use queuectl_core::{scheduler, Job, JobState, JobStore, QueueError, Result, Settings};
use tokio::signal::unix::{signal, SignalKind};

use crate::paths::Paths;
use crate::{control, executor};

/// Shadow file proving a worker is alive; created before the loop starts,
/// removed on every exit path (including early-return error paths, since
/// cleanup runs in `run` after the loop returns rather than relying on an
/// async `Drop`).
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(paths: &Paths, worker_id: &str) -> Result<Self> {
        let dir = paths.workers_dir();
        std::fs::create_dir_all(&dir).map_err(|e| QueueError::Store(e.to_string()))?;
        let path = paths.worker_pid_file(worker_id);
        std::fs::write(&path, worker_id).map_err(|e| QueueError::Store(e.to_string()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Run the worker loop. Returns only on graceful shutdown or a fatal store
/// error; registration/pid-file cleanup is guaranteed on both paths.
pub async fn run(store: Arc<dyn JobStore>, paths: &Paths) -> Result<()> {
    let worker_id = std::process::id().to_string();
    let now = control::now();

    reclaim_orphans(&store, paths, now).await?;

    store.register_worker(&worker_id, now).await?;
    let pid_file = PidFile::create(paths, &worker_id)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(Arc::clone(&shutdown));

    let settings = Settings::load(&store).await?;
    tracing::info!(worker_id = %worker_id, "worker started");

    let result = main_loop(&store, &worker_id, &settings, &shutdown).await;

    if let Err(e) = store.unregister_worker(&worker_id).await {
        tracing::warn!(worker_id = %worker_id, error = %e, "failed to unregister worker");
    }
    drop(pid_file);
    tracing::info!(worker_id = %worker_id, "worker stopped");

    result
}

async fn main_loop(
    store: &Arc<dyn JobStore>,
    worker_id: &str,
    settings: &Settings,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(settings.poll_interval_seconds as u64)).await;

        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let now = control::now();
        let job = match store.claim_next(worker_id, now).await {
            Ok(job) => job,
            Err(QueueError::Store(e)) => {
                tracing::error!(error = %e, "fatal store error, worker exiting");
                return Err(QueueError::Store(e));
            }
            Err(e) => {
                tracing::warn!(error = %e, "claim_next failed, retrying next poll");
                continue;
            }
        };

        let Some(job) = job else {
            continue;
        };

        tracing::info!(
            worker_id = %worker_id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            "executing job"
        );

        match executor::execute(&job.command).await {
            Ok(outcome) if outcome.success => {
                if let Err(e) = store.finalize_success(&job.id, control::now()).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to finalize success");
                }
            }
            Ok(outcome) => finalize_failed_attempt(store, &job, &outcome.output, settings).await,
            Err(e) => finalize_failed_attempt(store, &job, &e.to_string(), settings).await,
        }
    }
}

async fn finalize_failed_attempt(
    store: &Arc<dyn JobStore>,
    job: &Job,
    error: &str,
    settings: &Settings,
) {
    let attempts_so_far = job.attempts + 1;
    let decision = scheduler::decide(attempts_so_far, job.max_retries, settings.backoff_base_seconds);
    tracing::warn!(job_id = %job.id, attempt = attempts_so_far, decision = ?decision, "job attempt failed");
    if let Err(e) = store
        .finalize_failure(&job.id, error, decision, control::now())
        .await
    {
        tracing::error!(job_id = %job.id, error = %e, "failed to finalize failure");
    }
}

fn spawn_signal_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                tracing::info!("received SIGTERM, finishing current job before exit");
                flag.store(true, Ordering::SeqCst);
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    });
}

/// Reset jobs stuck `processing` under a dead worker back to `pending`.
///
/// A job is orphaned when its owner is absent from the live worker table
/// *and* that worker's pid file no longer exists -- either signal alone could
/// be a narrow race (worker mid-registration, or file not yet flushed).
async fn reclaim_orphans(store: &Arc<dyn JobStore>, paths: &Paths, now: i64) -> Result<()> {
    let processing = store.list_jobs(Some(JobState::Processing)).await?;
    if processing.is_empty() {
        return Ok(());
    }

    let live: HashSet<String> = store
        .list_workers()
        .await?
        .into_iter()
        .map(|w| w.worker_id)
        .collect();

    let candidates: Vec<String> = processing
        .into_iter()
        .filter_map(|job| job.owner)
        .filter(|owner| !live.contains(owner) && !paths.worker_pid_file(owner).exists())
        .collect();

    if candidates.is_empty() {
        return Ok(());
    }

    let reclaimed = store.reclaim_orphans(&candidates, now).await?;
    tracing::info!(count = reclaimed, "reclaimed orphaned jobs on startup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::{JobStore, NewJob};
    use queuectl_store::SqliteJobStore;

    async fn store() -> Arc<dyn JobStore> {
        let store = SqliteJobStore::connect_memory().await.unwrap();
        store.init().await.unwrap();
        Arc::new(store)
    }

    fn temp_paths() -> (Paths, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            Paths {
                home: dir.path().to_path_buf(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn reclaim_orphans_is_noop_with_no_processing_jobs() {
        let store = store().await;
        let (paths, _dir) = temp_paths();
        reclaim_orphans(&store, &paths, 0).await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_orphans_resets_job_whose_owner_has_no_pidfile() {
        let store = store().await;
        let (paths, _dir) = temp_paths();

        store
            .insert_job(NewJob {
                id: "a".to_string(),
                command: "true".to_string(),
                max_retries: 1,
                next_run_at: 0,
            })
            .await
            .unwrap();
        store.claim_next("dead-worker", 0).await.unwrap();

        reclaim_orphans(&store, &paths, 10).await.unwrap();

        let job = store.list_jobs(Some(JobState::Pending)).await.unwrap();
        assert_eq!(job.len(), 1);
        assert!(job[0].owner.is_none());
    }

    #[tokio::test]
    async fn reclaim_orphans_leaves_job_whose_pidfile_still_exists() {
        let store = store().await;
        let (paths, _dir) = temp_paths();

        store
            .insert_job(NewJob {
                id: "a".to_string(),
                command: "true".to_string(),
                max_retries: 1,
                next_run_at: 0,
            })
            .await
            .unwrap();
        store.claim_next("live-worker", 0).await.unwrap();

        std::fs::create_dir_all(paths.workers_dir()).unwrap();
        std::fs::write(paths.worker_pid_file("live-worker"), "live-worker").unwrap();

        reclaim_orphans(&store, &paths, 10).await.unwrap();

        let job = store.list_jobs(Some(JobState::Processing)).await.unwrap();
        assert_eq!(job.len(), 1, "pid file still present, not an orphan");
    }

    #[test]
    fn pid_file_is_removed_on_drop() {
        let (paths, _dir) = temp_paths();
        let path = paths.worker_pid_file("123");
        {
            let _guard = PidFile::create(&paths, "123").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
