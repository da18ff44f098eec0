use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::session::SessionAdmin;

/// Background sweeper that evicts sessions of the locked users at a fixed
/// interval until stopped.
pub struct LockUserMonitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LockUserMonitor {
    pub fn start(admin: Arc<dyn SessionAdmin>, users: Vec<String>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(?users, "lock user monitor started");
            loop {
                if let Err(err) = admin.kill_sessions_of_users(&users).await {
                    warn!(?err, "failed to evict lock user sessions");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
            }
            info!("lock user monitor stopped");
        });
        Self { stop, handle }
    }

    /// Signals the sweeper and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            warn!(?err, "lock user monitor task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CountingAdmin {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl SessionAdmin for CountingAdmin {
        async fn kill_sessions_of_users(&self, users: &[String]) -> Result<usize> {
            self.calls.lock().await.push(users.to_vec());
            Ok(0)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_until_stopped() {
        let admin = Arc::new(CountingAdmin::default());
        let monitor = LockUserMonitor::start(
            admin.clone(),
            vec!["app".into()],
            Duration::from_millis(100),
        );
        tokio::time::sleep(Duration::from_millis(350)).await;
        monitor.stop().await;

        let calls = admin.calls.lock().await.len();
        assert!(calls >= 3, "expected repeated sweeps, got {calls}");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(admin.calls.lock().await.len(), calls);
    }
}
