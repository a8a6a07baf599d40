//! Bounded exponential-backoff retry for transient failures

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySettings {
    pub fn new(retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: retries + 1,
            base_delay_ms,
            max_delay_ms: 30_000,
        }
    }
}

/// `base * 2^(attempt - 1)`, capped
pub fn next_retry_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_delay_ms.saturating_mul(factor).min(max_delay_ms))
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
/// Only errors with [`Error::is_transient`] are retried.
pub async fn retry_async<T, F, Fut>(
    operation_name: &str,
    settings: RetrySettings,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= settings.max_attempts {
                    error!(
                        "'{}' failed after {} attempts: {}",
                        operation_name, attempt, e
                    );
                    return Err(e);
                }
                let delay = next_retry_delay(attempt, settings.base_delay_ms, settings.max_delay_ms);
                warn!(
                    "'{}' failed, retrying in {:?} (attempt {}/{}): {}",
                    operation_name, delay, attempt, settings.max_attempts, e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Map a request timeout onto the crate error for the given kind of call
pub fn timeout_error(what: &str, after: Duration) -> Error {
    Error::inference_transient(format!("{} timed out after {:?}", what, after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(next_retry_delay(1, 100, 1000), Duration::from_millis(100));
        assert_eq!(next_retry_delay(2, 100, 1000), Duration::from_millis(200));
        assert_eq!(next_retry_delay(3, 100, 1000), Duration::from_millis(400));
        assert_eq!(next_retry_delay(9, 100, 1000), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_async("flaky", RetrySettings::new(3, 1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::source_failure(SourceErrorKind::Connection, "reset"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_async("auth", RetrySettings::new(5, 1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::source_failure(SourceErrorKind::Auth, "denied"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_async("down", RetrySettings::new(2, 1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::inference_transient("503"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
