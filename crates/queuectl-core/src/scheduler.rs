//! Pure retry/backoff decision logic.
//!
//! No IO, no async: given how many attempts a job has now completed and its
//! retry budget, decide whether it gets another chance and how long to wait.

/// What should happen to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-queue after `delay_seconds`.
    Retry { delay_seconds: i64 },
    /// Exhausted; move to the dead letter queue.
    Dead,
}

/// Ceiling on the computed backoff delay, matching the teacher's retry cap.
const MAX_DELAY_SECONDS: i64 = 3600;

/// Decide the outcome of a failed attempt.
///
/// `attempts_so_far` is the number of completed attempts including the one
/// that just failed. `max_retries` is the job's configured retry budget
/// (total attempts permitted = `max_retries + 1`).
pub fn decide(attempts_so_far: i64, max_retries: i64, backoff_base_seconds: i64) -> Decision {
    if attempts_so_far > max_retries {
        Decision::Dead
    } else {
        let delay_seconds = backoff_base_seconds
            .checked_pow(attempts_so_far as u32)
            .unwrap_or(MAX_DELAY_SECONDS)
            .min(MAX_DELAY_SECONDS);
        Decision::Retry { delay_seconds }
    }
}
