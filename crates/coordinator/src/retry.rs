//! Bounded retry with exponential backoff and per-attempt deadlines

use crate::config::RetryConfig;
use crate::error::{CoordinatorError, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    op_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            op_timeout: Duration::from_millis(config.op_timeout_ms),
        }
    }

    /// Backoff after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// Each attempt is bounded by the operation timeout; an expired attempt
    /// counts as a transient failure.
    pub async fn run<T, E, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<CoordinatorError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.op_timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e.into(),
                Err(_) => CoordinatorError::Timeout {
                    op,
                    timeout_ms: self.op_timeout.as_millis() as u64,
                },
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                tracing::warn!("{} failed after {} attempts: {}", op, attempt, err);
                return Err(CoordinatorError::RetriesExhausted {
                    op,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff(attempt);
            tracing::debug!(
                "{} attempt {}/{} failed ({}), retrying in {:?}",
                op,
                attempt,
                self.max_attempts,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedchain_bridge::LedgerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            op_timeout_ms: 5_000,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let value = policy(5)
            .run("ledger.current_round_id", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LedgerError::Timeout)
                } else {
                    Ok(7u64)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = policy(5)
            .run("ledger.submit_finalize", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::TransactionFailed("reverted".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, CoordinatorError::Ledger(LedgerError::TransactionFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let calls = AtomicU32::new(0);
        let err = policy(3)
            .run("ledger.round_info", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::Unavailable("down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, CoordinatorError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let err = policy(2)
            .run("content_store.get", || async {
                std::future::pending::<std::result::Result<(), LedgerError>>().await
            })
            .await
            .unwrap_err();
        match err {
            CoordinatorError::RetriesExhausted { last, .. } => {
                assert!(matches!(*last, CoordinatorError::Timeout { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
