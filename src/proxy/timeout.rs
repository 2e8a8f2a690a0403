//! Inactivity countdown
//!
//! A single task owns the deadline. [`InactivityTimer::reset`] rearms it to a
//! full period from now; when a period elapses untouched the expiry callback
//! runs once and the task ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct InactivityTimer {
    rearm: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl InactivityTimer {
    pub fn start<F>(period: Duration, cancel: CancellationToken, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let rearm = Arc::new(Notify::new());
        let cancel = cancel.child_token();
        let task = tokio::spawn({
            let rearm = rearm.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = rearm.notified() => continue,
                        _ = tokio::time::sleep(period) => break,
                    }
                }
                info!("No activity for {}s, shutting down", period.as_secs());
                on_expire();
            }
        });

        Self {
            rearm,
            cancel,
            task,
        }
    }

    /// Restart the countdown from now
    pub fn reset(&self) {
        self.rearm.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn advance_to(start: tokio::time::Instant, at: Duration) {
        tokio::time::sleep_until(start + at).await;
        // let the timer task observe the new time
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_pushes_expiry_out() {
        let start = tokio::time::Instant::now();
        let expired = CancellationToken::new();
        let timer = InactivityTimer::start(Duration::from_secs(5), CancellationToken::new(), {
            let expired = expired.clone();
            move || expired.cancel()
        });
        tokio::task::yield_now().await;

        advance_to(start, Duration::from_secs(4)).await;
        timer.reset();
        tokio::task::yield_now().await;

        advance_to(start, Duration::from_millis(8900)).await;
        assert!(!expired.is_cancelled());

        advance_to(start, Duration::from_millis(9100)).await;
        assert!(expired.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_without_activity() {
        let expired = CancellationToken::new();
        let _timer = InactivityTimer::start(Duration::from_secs(5), CancellationToken::new(), {
            let expired = expired.clone();
            move || expired.cancel()
        });
        tokio::time::sleep(Duration::from_millis(5100)).await;
        tokio::task::yield_now().await;
        assert!(expired.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_countdown() {
        let expired = CancellationToken::new();
        let cancel = CancellationToken::new();
        let timer = InactivityTimer::start(Duration::from_secs(5), cancel.clone(), {
            let expired = expired.clone();
            move || expired.cancel()
        });
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!expired.is_cancelled());
        assert!(timer.is_finished());
    }
}
