use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::warn;

use crate::error::{HubError, Result};

#[derive(Debug, Default)]
struct State {
    count: usize,
    until: Option<Instant>,
    timed_out: bool,
    canceled: bool,
}

/// Counting wait-group whose waits can be bounded by a deadline that
/// may be moved while a wait is in flight.
///
/// Completion observed at or before the deadline is success; a wait only
/// fails once the deadline has passed with the counter still above zero.
#[derive(Debug, Default)]
pub struct ExtendedWaitGroup {
    state: Mutex<State>,
    notify: Notify,
}

impl ExtendedWaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: usize) {
        let mut state = self.lock();
        state.count += delta;
    }

    pub fn done(&self) {
        let mut state = self.lock();
        if state.count == 0 {
            warn!("ExtendedWaitGroup::done called with zero counter");
            return;
        }
        state.count -= 1;
        if state.count == 0 {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Current counter value
    pub fn pending(&self) -> usize {
        self.lock().count
    }

    /// Move the deadline of any in-flight bounded wait
    pub fn update_until(&self, until: Instant) {
        self.lock().until = Some(until);
        self.notify.notify_waiters();
    }

    /// Abort all waits; they return `Canceled`
    pub fn cancel(&self) {
        self.lock().canceled = true;
        self.notify.notify_waiters();
    }

    /// True once a bounded wait has timed out or the group was canceled
    pub fn is_canceled(&self) -> bool {
        let state = self.lock();
        state.timed_out || state.canceled
    }

    /// Wait for the counter to reach zero, ignoring any deadline
    pub async fn wait(&self) -> Result<()> {
        self.wait_inner(false).await
    }

    pub async fn wait_with_timeout(&self, duration: Duration) -> Result<()> {
        self.wait_until(Instant::now() + duration).await
    }

    pub async fn wait_until(&self, until: Instant) -> Result<()> {
        self.lock().until = Some(until);
        self.wait_inner(true).await
    }

    /// Wait against whatever deadline [`update_until`](Self::update_until)
    /// last set; unbounded if none was set
    pub async fn wait_bounded(&self) -> Result<()> {
        self.wait_inner(true).await
    }

    async fn wait_inner(&self, bounded: bool) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let state = self.lock();
                if state.count == 0 {
                    return Ok(());
                }
                if state.canceled {
                    return Err(HubError::Canceled);
                }
                if bounded {
                    state.until
                } else {
                    None
                }
            };

            let Some(deadline) = deadline else {
                notified.await;
                continue;
            };

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {
                    let mut state = self.lock();
                    if state.count == 0 {
                        return Ok(());
                    }
                    // deadline moved while we slept
                    if state.until.is_some_and(|until| until > deadline) {
                        continue;
                    }
                    state.timed_out = true;
                    return Err(HubError::WaitTimeout);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_deadline() {
        let wg = Arc::new(ExtendedWaitGroup::new());
        wg.add(1);

        let worker = Arc::clone(&wg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            worker.done();
        });

        wg.wait_with_timeout(Duration::from_millis(200)).await.unwrap();
        assert!(!wg.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_done() {
        let wg = ExtendedWaitGroup::new();
        wg.add(1);

        let err = wg.wait_with_timeout(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, HubError::WaitTimeout));
        assert_eq!(err.to_string(), "group timed out");
        assert!(wg.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_until_extends_inflight_wait() {
        let wg = Arc::new(ExtendedWaitGroup::new());
        wg.add(1);

        let worker = Arc::clone(&wg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            worker.update_until(Instant::now() + Duration::from_millis(500));
            tokio::time::sleep(Duration::from_millis(250)).await;
            worker.done();
        });

        // would time out at 100ms without the extension
        wg.wait_with_timeout(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_until_can_shorten_deadline() {
        let wg = Arc::new(ExtendedWaitGroup::new());
        wg.add(1);

        let worker = Arc::clone(&wg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker.update_until(Instant::now() + Duration::from_millis(20));
        });

        let started = Instant::now();
        let result = wg.wait_with_timeout(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(HubError::WaitTimeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_set_before_wait_is_kept() {
        let wg = Arc::new(ExtendedWaitGroup::new());
        wg.add(1);
        wg.update_until(Instant::now() + Duration::from_millis(100));

        let worker = Arc::clone(&wg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            worker.update_until(Instant::now() + Duration::from_millis(300));
        });

        let started = Instant::now();
        assert!(matches!(wg.wait_bounded().await, Err(HubError::WaitTimeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(350), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_zero_counter_returns_immediately() {
        let wg = ExtendedWaitGroup::new();
        wg.wait().await.unwrap();
        wg.wait_with_timeout(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_unbounded_wait() {
        let wg = Arc::new(ExtendedWaitGroup::new());
        wg.add(2);

        let canceller = Arc::clone(&wg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert!(matches!(wg.wait().await, Err(HubError::Canceled)));
        assert!(wg.is_canceled());
    }
}
