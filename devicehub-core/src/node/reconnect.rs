use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Node-side watchdog over the master's pings
///
/// The master pings every node on a fixed interval. When no ping arrives
/// for `stale_after` the tunnel is considered dead and the node dials
/// again.
pub struct ReconnectHandler {
    last_ping: Mutex<Instant>,
    stale_after: Duration,
    check_interval: Duration,
}

impl ReconnectHandler {
    pub fn new(stale_after: Duration, check_interval: Duration) -> Self {
        Self {
            last_ping: Mutex::new(Instant::now()),
            stale_after,
            check_interval,
        }
    }

    pub async fn ping_received(&self) {
        *self.last_ping.lock().await = Instant::now();
    }

    /// Start a fresh grace period, e.g. right after (re)connecting
    pub async fn reset(&self) {
        self.ping_received().await;
    }

    pub async fn is_stale(&self) -> bool {
        self.last_ping.lock().await.elapsed() > self.stale_after
    }

    /// Resolve once the master has been silent for too long
    pub async fn wait_stale(&self) {
        loop {
            if self.is_stale().await {
                return;
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_link_fresh() {
        let handler = ReconnectHandler::new(Duration::from_secs(30), Duration::from_secs(1));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handler.ping_received().await;
        }
        assert!(!handler.is_stale().await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handler.is_stale().await);

        handler.reset().await;
        assert!(!handler.is_stale().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_stale_resolves_after_silence() {
        let handler = Arc::new(ReconnectHandler::new(
            Duration::from_secs(30),
            Duration::from_secs(1),
        ));
        let started = Instant::now();

        handler.wait_stale().await;
        let waited = started.elapsed();
        assert!(waited > Duration::from_secs(30));
        assert!(waited <= Duration::from_secs(32));
    }
}
