// =============================================================================
// Shutdown — cooperative cancellation signal
// =============================================================================
//
// Every long-running loop (watch loop, subscription maintainer, health loop,
// matcher loop, dispatcher loop) races its normal work against
// `Shutdown::signalled()` inside a `tokio::select!`. There is no forced task
// abort: a loop observes the flag on its own schedule and exits cleanly,
// which is what lets the Supervisor's drain have something to wait on.
// =============================================================================

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

/// Handle to the shutdown signal. Cheap to clone; every component gets its
/// own handle rather than sharing a reference to one owner.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is requested. Intended as the losing branch of
    /// a `tokio::select!` alongside a loop's real work.
    pub async fn signalled(&mut self) {
        // `changed()` only errors if the sender was dropped, which only
        // happens if the owning `ShutdownController` itself was dropped —
        // treat that the same as a shutdown request.
        let _ = self.rx.changed().await;
    }
}

/// Owned by the Supervisor. Dropping this (or calling `trigger`) flips every
/// outstanding `Shutdown` handle.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn handle(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    /// Flip the signal. Idempotent — a second call is a no-op send of the
    /// same value.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Wait up to `timeout` for all cloned receivers other than this
    /// controller's own internal one to be dropped. Used by the Supervisor
    /// to bound the drain phase of shutdown; a timeout here is logged, not
    /// fatal — the process is exiting either way.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.tx.receiver_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.tx.receiver_count(),
                    "shutdown drain timed out — some components may not have exited cleanly"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalled_resolves_after_trigger() {
        let controller = ShutdownController::new();
        let mut handle = controller.handle();
        assert!(!handle.is_shutdown());

        controller.trigger();
        handle.signalled().await;
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn multiple_handles_all_observe_trigger() {
        let controller = ShutdownController::new();
        let mut a = controller.handle();
        let mut b = controller.handle();

        controller.trigger();
        a.signalled().await;
        b.signalled().await;
        assert!(a.is_shutdown());
        assert!(b.is_shutdown());
    }

    #[tokio::test]
    async fn drain_returns_once_handles_dropped() {
        let controller = ShutdownController::new();
        let handle = controller.handle();
        drop(handle);
        controller.drain(Duration::from_secs(1)).await;
    }
}
