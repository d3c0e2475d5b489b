//! Deadlines and bounded retries for registry calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::error::RegistryError;
use crate::metrics;

/// Timeout and backoff applied to each registry call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled after each retry.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, bounding each attempt by `call_timeout` and retrying
    /// retryable failures with exponential backoff.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1u32;

        loop {
            let result = match timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout {
                    operation,
                    elapsed: self.call_timeout,
                }),
            };

            match result {
                Ok(value) => {
                    metrics::record_registry_call(operation, "ok");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    metrics::record_registry_call(operation, "retry");
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retryable registry error"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    metrics::record_registry_call(operation, "error");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_secs(1),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .call("ListHealthChecks", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RegistryError::service("ListHealthChecks", "Throttling", "slow down"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .call("ListHealthChecks", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::service("ListHealthChecks", "AccessDenied", "no"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .call("ListHealthChecks", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::service("ListHealthChecks", "ServiceUnavailable", "down"))
            })
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..fast()
        };
        let result: Result<(), _> = policy
            .call("ListResourceRecordSets", || async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(RegistryError::Timeout { .. })));
    }
}
