use thiserror::Error;

/// The closed set of error kinds the job lifecycle engine distinguishes.
///
/// Control API operations surface these to the CLI as-is; worker loops treat
/// only [`QueueError::Store`] as fatal and convert everything else touching a
/// job attempt into a failure outcome fed to the scheduler.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("duplicate job id: {0}")]
    DuplicateId(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} is not in the dead letter queue")]
    NotInDlq(String),

    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("command executor failed: {0}")]
    Executor(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
