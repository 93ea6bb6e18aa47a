//! Cancellation helpers.
//!
//! Every provider operation takes a [`CancellationToken`]. In-flight futures
//! are raced against the token so that cancelling aborts network I/O instead
//! of only refusing to start the next request.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Fail with `Cancelled` if the token has fired.
pub fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Run `fut` until it completes or the token fires.
///
/// The future is dropped on cancellation, which aborts any request it owns.
pub async fn run_cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    ensure_active(token)?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Sleep for `duration` unless the token fires first.
pub async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> Result<()> {
    run_cancellable(token, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let value = run_cancellable(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_poll() {
        let token = CancellationToken::new();
        token.cancel();
        let polled = std::sync::atomic::AtomicBool::new(false);
        let result: Result<()> = run_cancellable(&token, async {
            polled.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let result = sleep_cancellable(&token, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
