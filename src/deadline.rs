//! Resettable single-shot deadline.
//!
//! One background task per deadline waits for the current expiry instant.
//! Re-arming replaces the instant, so there is never more than one pending
//! expiry no matter how often traffic resets it.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub(crate) struct Deadline {
    at: watch::Sender<Option<Instant>>,
}

impl Deadline {
    /// Spawn the timer task. `on_expire` runs each time an armed deadline
    /// passes without being re-armed. The task ends when `cancel` fires or the
    /// `Deadline` is dropped.
    pub(crate) fn spawn<F>(on_expire: F, cancel: CancellationToken) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(run(rx, on_expire, cancel));
        Self { at: tx }
    }

    /// (Re)arm to expire `after` from now.
    pub(crate) fn arm(&self, after: Duration) {
        self.at.send_replace(Some(Instant::now() + after));
    }

    pub(crate) fn disarm(&self) {
        self.at.send_replace(None);
    }
}

async fn run<F>(mut rx: watch::Receiver<Option<Instant>>, on_expire: F, cancel: CancellationToken)
where
    F: Fn(),
{
    loop {
        let at = *rx.borrow_and_update();
        match at {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        trace!("deadline expired");
                        on_expire();
                        // stay quiet until re-armed
                        tokio::select! {
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                            _ = cancel.cancelled() => return,
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            None => {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting() -> (Arc<AtomicUsize>, impl Fn() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (fired, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once() {
        let (fired, cb) = counting();
        let deadline = Deadline::spawn(cb, CancellationToken::new());

        deadline.arm(Duration::from_millis(100));
        settle().await;
        tokio::time::advance(Duration::from_millis(99)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_postpones_full_interval() {
        let (fired, cb) = counting();
        let deadline = Deadline::spawn(cb, CancellationToken::new());

        deadline.arm(Duration::from_millis(100));
        settle().await;
        tokio::time::advance(Duration::from_millis(80)).await;
        deadline.arm(Duration::from_millis(100));
        settle().await;

        tokio::time::advance(Duration::from_millis(80)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(30)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_and_cancel() {
        let (fired, cb) = counting();
        let cancel = CancellationToken::new();
        let deadline = Deadline::spawn(cb, cancel.clone());

        deadline.arm(Duration::from_millis(50));
        settle().await;
        deadline.disarm();
        settle().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        deadline.arm(Duration::from_millis(50));
        cancel.cancel();
        settle().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
