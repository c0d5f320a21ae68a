//! Transaction retry policy.
//!
//! Serializable transactions that collide with another worker fail with a
//! serialization error and must be re-run from the start. Every claim and
//! completion is idempotent at the row level, so re-running is always safe.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::debug;

use super::store::StoreError;

/// Default number of attempts before a transaction is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const BASE_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 1_000;

/// SQLSTATE / SQLite result codes that mean "run the transaction again".
///
/// - `40001`: serialization_failure (PostgreSQL, CockroachDB restarts)
/// - `40P01`: deadlock_detected
/// - `5`, `517`, `6`: SQLITE_BUSY, SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED
const RETRYABLE_CODES: &[&str] = &["40001", "40P01", "5", "517", "6"];

/// Returns whether a database error is a transient conflict.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| RETRYABLE_CODES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}

/// How often and how patiently conflicting transactions are retried.
#[derive(Debug, Clone, Copy)]
pub struct TxRetryPolicy {
    max_attempts: u32,
}

impl Default for TxRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl TxRetryPolicy {
    /// Creates a policy allowing `max_attempts` runs (at least one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Maximum number of runs per operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent.
    ///
    /// Each call of `attempt` must perform a whole transaction, from begin to
    /// commit.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut tries = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) => {
                    if tries >= self.max_attempts {
                        return Err(StoreError::RetriesExhausted {
                            operation,
                            attempts: tries,
                            source: err,
                        });
                    }
                    let delay = backoff_delay(tries);
                    debug!(
                        operation = operation,
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying transaction after conflict"
                    );
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                Err(err) => return Err(StoreError::QueryFailed(err)),
            }
        }
    }
}

/// Exponential backoff with +/-25% jitter, capped at one second.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BASE_DELAY_MS.saturating_mul(1u64 << exp).min(MAX_DELAY_MS);
    let spread = (base as f64 * 0.25).max(1.0);
    let lower = (base as f64 - spread).max(1.0);
    let upper = (base as f64 + spread).min(MAX_DELAY_MS as f64);
    let millis = rand::rng().random_range(lower..=upper).round() as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_bounded() {
        for attempt in 1..40 {
            let delay = backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= Duration::from_millis(MAX_DELAY_MS));
        }
    }

    #[test]
    fn test_non_database_errors_are_not_retryable() {
        assert!(!is_retryable(&sqlx::Error::RowNotFound));
        assert!(!is_retryable(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_policy_has_at_least_one_attempt() {
        assert_eq!(TxRetryPolicy::new(0).max_attempts(), 1);
        assert_eq!(TxRetryPolicy::default().max_attempts(), DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = TxRetryPolicy::new(3)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, sqlx::Error>(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_fatal_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = TxRetryPolicy::new(5)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(sqlx::Error::RowNotFound)
            })
            .await;
        assert!(matches!(result, Err(StoreError::QueryFailed(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
