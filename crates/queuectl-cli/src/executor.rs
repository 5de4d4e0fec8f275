//! Command Executor: runs a job's command through a shell and reports the
//! outcome. Delegating to `sh -c` is a deliberate trade-off so user commands
//! can use pipelines and redirection; the core does not offer an argv-only
//! mode.

use queuectl_core::{QueueError, Result};
use tokio::process::Command;

const OUTPUT_MAX_LEN: usize = 4096;

pub struct ExecOutcome {
    pub success: bool,
    /// Combined, truncated stdout+stderr. Empty on success.
    pub output: String,
}

/// Run `command` via `sh -c`. Only a failure to spawn the shell itself
/// returns `Err`; a non-zero exit is reported as `Ok(ExecOutcome { success: false, .. })`.
pub async fn execute(command: &str) -> Result<ExecOutcome> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| QueueError::Executor(e.to_string()))?;

    let success = output.status.success();
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if combined.len() > OUTPUT_MAX_LEN {
        combined.truncate(OUTPUT_MAX_LEN);
        combined.push_str("... (truncated)");
    }

    Ok(ExecOutcome {
        success,
        output: combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_exit_is_success() {
        let outcome = execute("exit 0").await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let outcome = execute("exit 7").await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn captures_combined_output() {
        let outcome = execute("echo out; echo err 1>&2; exit 1").await.unwrap();
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
    }

    #[tokio::test]
    async fn truncates_long_output() {
        let outcome = execute("yes x | head -c 20000").await.unwrap();
        assert!(outcome.output.len() < 20000);
        assert!(outcome.output.ends_with("(truncated)"));
    }
}
