//! State directory resolution.
//!
//! `QUEUECTL_HOME` overrides the default `~/.queuectl` root. It is read once,
//! at process start, by every entry point -- before the store can even be
//! opened, so it cannot itself be a store-backed config value.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub struct Paths {
    pub home: PathBuf,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        let home = match std::env::var_os("QUEUECTL_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let base = dirs_home().context("could not determine home directory")?;
                base.join(".queuectl")
            }
        };
        Ok(Self { home })
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("queue.db")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.home.join("workers")
    }

    pub fn worker_pid_file(&self, worker_id: &str) -> PathBuf {
        self.workers_dir().join(format!("worker.{worker_id}.pid"))
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // QUEUECTL_HOME is process-global; serialize tests that touch it so they
    // don't clobber each other when run concurrently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_override_wins_over_home() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("QUEUECTL_HOME", "/tmp/queuectl-test-home");
        let paths = Paths::resolve().unwrap();
        assert_eq!(paths.home, PathBuf::from("/tmp/queuectl-test-home"));
        assert_eq!(paths.db_path(), PathBuf::from("/tmp/queuectl-test-home/queue.db"));
        std::env::remove_var("QUEUECTL_HOME");
    }

    #[test]
    fn worker_pid_file_encodes_worker_id() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("QUEUECTL_HOME", "/tmp/queuectl-test-home2");
        let paths = Paths::resolve().unwrap();
        assert_eq!(
            paths.worker_pid_file("1234"),
            PathBuf::from("/tmp/queuectl-test-home2/workers/worker.1234.pid")
        );
        std::env::remove_var("QUEUECTL_HOME");
    }
}
