//! Timeout and backoff around transaction-source calls

use std::future::Future;
use tracing::warn;

use crate::config::OracleConfig;
use crate::{OracleError, OracleResult};

/// Run `op` with a per-attempt timeout, retrying transient failures.
///
/// Backoff starts at `retry_backoff` and doubles after each failed attempt.
/// Non-transient errors are returned immediately.
pub async fn with_retry<T, F, Fut>(config: &OracleConfig, what: &str, mut op: F) -> OracleResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OracleResult<T>>,
{
    let attempts = config.max_retries.max(1);
    let timeout = config.rpc_timeout();
    let mut delay = config.retry_backoff();

    let mut attempt = 1;
    loop {
        let error = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => OracleError::Timeout(timeout),
        };

        if attempt >= attempts {
            return Err(error);
        }

        warn!(
            "{} failed (attempt {}/{}): {}, retrying in {:?}",
            what, attempt, attempts, error, delay
        );
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> OracleConfig {
        OracleConfig::default().with_retry(
            Duration::from_millis(100),
            3,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retry(&config(), "fetch", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OracleError::TransactionSource("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: OracleResult<()> = with_retry(&config(), "fetch", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::TransactionSource("down".into()))
        })
        .await;

        assert!(matches!(result, Err(OracleError::TransactionSource(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: OracleResult<()> = with_retry(&config(), "fetch", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::InvalidInput("bad signature".into()))
        })
        .await;

        assert!(matches!(result, Err(OracleError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let result: OracleResult<()> = with_retry(&config(), "fetch", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(OracleError::Timeout(_))));
    }
}
