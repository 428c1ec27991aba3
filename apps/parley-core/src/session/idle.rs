use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-session inactivity watchdog. There is a single deadline; `touch` moves it
/// before the watcher sleeps again, so only the most recent arming can fire.
#[derive(Clone)]
pub struct IdleMonitor {
    deadline: watch::Sender<Instant>,
    timeout: Duration,
}

impl IdleMonitor {
    pub fn spawn<F>(timeout: Duration, cancel: CancellationToken, on_expire: F) -> (Self, JoinHandle<()>)
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(Instant::now() + timeout);
        let task = tokio::spawn(async move {
            loop {
                let deadline = *rx.borrow_and_update();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() { return; }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        if rx.has_changed().unwrap_or(false) { continue; }
                        debug!(?timeout, "idle deadline reached");
                        on_expire();
                        return;
                    }
                }
            }
        });
        (Self { deadline: tx, timeout }, task)
    }

    /// Re-arms the watchdog for a full window from now.
    pub fn touch(&self) {
        self.deadline.send_replace(Instant::now() + self.timeout);
    }

    pub fn timeout(&self) -> Duration { self.timeout }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicU32>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        (fired, move || { f.fetch_add(1, Ordering::SeqCst); })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout_without_activity() {
        let (fired, on_expire) = counter();
        let (_idle, task) = IdleMonitor::spawn(Duration::from_secs(120), CancellationToken::new(), on_expire);
        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        task.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_just_before_expiry_grants_a_full_window() {
        let (fired, on_expire) = counter();
        let start = Instant::now();
        let (idle, task) = IdleMonitor::spawn(Duration::from_secs(10), CancellationToken::new(), on_expire);
        tokio::time::sleep(Duration::from_millis(9_990)).await;
        idle.touch();
        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "closed before the renewed window elapsed");
        task.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(19_990));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_monitor_never_fires() {
        let (fired, on_expire) = counter();
        let cancel = CancellationToken::new();
        let (_idle, task) = IdleMonitor::spawn(Duration::from_secs(1), cancel.clone(), on_expire);
        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
