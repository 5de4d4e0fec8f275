//! Worker supervisor: spawns worker processes and signals them to stop.
//! Stateless -- it discovers live workers purely from pid files on disk, the
//! same shadow the workers themselves maintain.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use queuectl_core::{QueueError, Result};

use crate::paths::Paths;

/// Spawn `count` detached worker processes, each re-invoking the current
/// binary with the hidden `worker run` subcommand in its own process group
/// so it survives this process exiting.
pub fn start(count: u32) -> Result<u32> {
    let exe = std::env::current_exe().map_err(|e| QueueError::Spawn(e.to_string()))?;

    for _ in 0..count {
        std::process::Command::new(&exe)
            .arg("worker")
            .arg("run")
            .process_group(0)
            .spawn()
            .map_err(|e| QueueError::Spawn(e.to_string()))?;
    }

    Ok(count)
}

pub struct StopReport {
    pub stopped: usize,
    pub stuck: Vec<i32>,
}

const STOP_DEADLINE: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Signal every live worker and wait up to [`STOP_DEADLINE`] for its pid file
/// to disappear. Workers that don't stop in time are reported, not escalated
/// to a forced kill -- this command always reports success even with
/// stragglers, since a stuck worker isn't a failure of `worker stop` itself.
pub async fn stop(paths: &Paths) -> Result<StopReport> {
    let workers = list_worker_pid_files(paths)?;
    let total = workers.len();

    for (pid, _) in &workers {
        if let Err(e) = kill(Pid::from_raw(*pid), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to signal worker");
        }
    }

    let mut remaining = workers;
    let deadline = Instant::now() + STOP_DEADLINE;
    loop {
        remaining.retain(|(_, path)| path.exists());
        if remaining.is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let stuck: Vec<i32> = remaining.into_iter().map(|(pid, _)| pid).collect();

    Ok(StopReport {
        stopped: total - stuck.len(),
        stuck,
    })
}

fn list_worker_pid_files(paths: &Paths) -> Result<Vec<(i32, PathBuf)>> {
    let dir = paths.workers_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(|e| QueueError::Store(e.to_string()))? {
        let entry = entry.map_err(|e| QueueError::Store(e.to_string()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(pid_str) = name.strip_prefix("worker.").and_then(|s| s.strip_suffix(".pid")) else {
            continue;
        };
        if let Ok(pid) = pid_str.parse::<i32>() {
            found.push((pid, path));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (Paths, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            Paths {
                home: dir.path().to_path_buf(),
            },
            dir,
        )
    }

    #[test]
    fn lists_only_well_formed_pid_files() {
        let (paths, _dir) = temp_paths();
        std::fs::create_dir_all(paths.workers_dir()).unwrap();
        std::fs::write(paths.worker_pid_file("123"), "123").unwrap();
        std::fs::write(paths.workers_dir().join("not-a-pid-file.txt"), "junk").unwrap();

        let found = list_worker_pid_files(&paths).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 123);
    }

    #[test]
    fn empty_workers_dir_yields_no_workers() {
        let (paths, _dir) = temp_paths();
        let found = list_worker_pid_files(&paths).unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn stop_with_no_workers_reports_nothing_stuck() {
        let (paths, _dir) = temp_paths();
        let report = stop(&paths).await.unwrap();
        assert!(report.stuck.is_empty());
    }
}
