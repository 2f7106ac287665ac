use super::ResilienceError;
use std::future::Future;
use std::time::Duration;

/// Run `future` with a hard deadline.
///
/// On expiry the future is dropped, which cancels any in-progress I/O it owns.
pub async fn with_timeout<T, E, Fut>(duration: Duration, future: Fut) -> Result<T, E>
where
    E: From<ResilienceError>,
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(E::from(ResilienceError::Timeout(duration))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_future_is_dropped() {
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let result: Result<(), ResilienceError> = with_timeout(Duration::from_secs(10), async move {
            tokio::time::sleep(Duration::from_secs(11)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert_eq!(result, Err(ResilienceError::Timeout(Duration::from_secs(10))));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_future_passes_through() {
        let result: Result<u8, ResilienceError> =
            with_timeout(Duration::from_secs(10), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
