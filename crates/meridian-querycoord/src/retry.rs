//! Bounded retry with a fixed interval.
//!
//! Used for worker-client bring-up (large bound, short interval, so the
//! coordinator patiently waits for workers that have not registered yet) and
//! for per-RPC recall (small bound).

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoordError;

/// Calls `op` until it succeeds or `attempts` runs out, sleeping `interval`
/// between attempts. Returns the first success or the last error.
pub async fn retry<T, E, F, Fut>(attempts: u32, interval: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts.max(1) => return Err(err),
            Err(_) => {
                debug!(attempt, "operation failed, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Like [`retry`] but gives up with [`CoordError::Cancelled`] as soon as the
/// scope is cancelled, including mid-sleep.
pub async fn retry_cancellable<T, F, Fut>(
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, CoordError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoordError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(CoordError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts.max(1) => return Err(err),
            Err(_) => {
                debug!(attempt, "operation failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(CoordError::Cancelled),
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_last_error_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), u32> = retry(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(n) }
        })
        .await;

        assert_eq!(result.unwrap_err(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_mid_sequence() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = retry(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let result: Result<(), CoordError> =
            retry_cancellable(1_000, Duration::from_secs(60), &cancel, || async {
                Err(CoordError::Internal("down".to_owned()))
            })
            .await;

        assert!(matches!(result, Err(CoordError::Cancelled)));
    }
}
