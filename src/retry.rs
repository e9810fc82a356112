use crate::error::{MonitorError, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

/// Retry executor for handling recoverable operations
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Execute an operation, retrying only errors that are recoverable
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err, self.policy.delay_ms);
                    sleep(Duration::from_millis(self.policy.delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub async fn retry_with_linear_backoff<F, Fut, T>(
    operation: F,
    max_attempts: u32,
    delay_ms: u64,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let executor = RetryExecutor::new(RetryPolicy { max_attempts, delay_ms });

    executor.execute(operation).await
}

/// Wrap an I/O failure so the retry executor can classify it.
pub fn io_failure(err: std::io::Error) -> MonitorError {
    MonitorError::Io(err)
}
