use std::time::Duration;

use crate::error::{BackendError, BackendResult};

/// Run `op`, retrying connection-class failures with exponential backoff.
///
/// Delays are `initial_delay * 2^k` for `k = 0..attempts`; anything that
/// is not retryable surfaces immediately.
pub(crate) async fn with_retries<T, F, Fut>(attempts: u32, initial_delay: Duration, mut op: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = initial_delay * 2u32.saturating_pow(attempt);
                attempt += 1;

                log::warn!("Backend connection failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {err}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_connection_errors_then_succeeds() {
        let calls = AtomicU32::new(0);

        let result = with_retries(3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::Connection("refused".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn api_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: BackendResult<()> = with_retries(3, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BackendError::Api {
                    status: 500,
                    message: "broken".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_configured_attempts() {
        let calls = AtomicU32::new(0);

        let result: BackendResult<()> = with_retries(2, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Connection("reset".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BackendError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
