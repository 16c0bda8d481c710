//! Coordination signals between foreground requests and background work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Advisory pause flag: foreground requests hold a guard for their
/// duration; background tasks yield between batches while any guard is
/// live. Nothing blocks on acknowledgement.
#[derive(Clone, Default)]
pub struct PauseSignal {
    foreground: Arc<AtomicUsize>,
}

impl PauseSignal {
    /// Create an unpaused signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a guard for the duration of a foreground request.
    pub fn guard(&self) -> PauseGuard {
        self.foreground.fetch_add(1, Ordering::SeqCst);
        PauseGuard {
            foreground: Arc::clone(&self.foreground),
        }
    }

    /// Whether any foreground request is in flight.
    pub fn is_paused(&self) -> bool {
        self.foreground.load(Ordering::SeqCst) > 0
    }

    /// Sleep-and-recheck until no foreground request is live or the task
    /// is cancelled.
    pub(crate) async fn yield_while_paused(&self, cancel: &CancellationToken) {
        while self.is_paused() && !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// RAII guard; dropping it releases the pause request.
pub struct PauseGuard {
    foreground: Arc<AtomicUsize>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.foreground.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_foreground_requests() {
        let signal = PauseSignal::new();
        assert!(!signal.is_paused());

        let g1 = signal.guard();
        let g2 = signal.guard();
        assert!(signal.is_paused());

        drop(g1);
        assert!(signal.is_paused());

        drop(g2);
        assert!(!signal.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn yield_returns_once_unpaused() {
        let signal = PauseSignal::new();
        let cancel = CancellationToken::new();
        let guard = signal.guard();

        let waiter = {
            let signal = signal.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { signal.yield_while_paused(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
