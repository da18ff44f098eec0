use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Runs `probe` every `interval` until it returns true or `timeout` elapses.
/// The probe always runs at least once; returns whether it succeeded.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_probe_turns_true() {
        let calls = AtomicU32::new(0);
        let ok = poll_until(Duration::from_secs(10), Duration::from_secs(1), || async {
            calls.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let start = Instant::now();
        let calls = AtomicU32::new(0);
        let ok = poll_until(Duration::from_secs(5), Duration::from_secs(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        })
        .await;
        assert!(!ok);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        // t = 0, 2, 4, 5
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
