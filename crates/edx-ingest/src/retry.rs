//! Shared retry policy for network fetches and object-store uploads
//!
//! One policy object replaces per-call retry loops: bounded attempts,
//! exponential backoff with a cap, and an overall timeout around the whole
//! sequence. Only errors that report `is_retryable()` are retried.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Budget for all attempts of one operation, sleeps included
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(IngestError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(IngestError::Config("retry.timeout_secs must be greater than 0".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(IngestError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Sleep before attempt `attempt + 1`, doubling from the base delay
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = Duration::from_secs(self.timeout_secs);
        match tokio::time::timeout(budget, self.attempts(operation, op)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_secs = self.timeout_secs, "Operation timed out");
                Err(IngestError::Timeout(self.timeout_secs))
            },
        }
    }

    async fn attempts<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            debug!(operation, attempt, max = self.max_attempts, "Attempt starting");
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {}ms...",
                        operation,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 250,
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let p = policy();
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(250));
        assert_eq!(p.delay_after(80), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy()
            .run("fetch", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IngestError::fetch("http://x", "503", true))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = policy()
            .run("upload", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IngestError::upload("k", "500"))
            })
            .await;
        assert!(matches!(result, Err(IngestError::Upload { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = policy()
            .run("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IngestError::NotFound("gone".into()))
            })
            .await;
        assert!(matches!(result, Err(IngestError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let p = RetryPolicy {
            timeout_secs: 1,
            ..policy()
        };
        let result: Result<()> = p
            .run("fetch", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(IngestError::Timeout(1))));
    }

    #[test]
    fn test_validate() {
        assert!(policy().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..policy() }.validate().is_err());
        assert!(RetryPolicy { max_delay_ms: 1, ..policy() }.validate().is_err());
    }
}
