//! Wait for a dynamic set of running tasks to finish.
//!
//! A [`WaitGroup`] holds the only receiver of an mpsc channel and every
//! [`WaitGuard`] holds a sender. The receiver wakes up once the last guard
//! is dropped, which is exactly when all tasks holding one are done.

use futures::never::Never;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Waits for all [`WaitGuard`]s created alongside it to be dropped.
///
/// Single-use: [`WaitGroup::wait`] consumes the group.
#[derive(Debug)]
pub(crate) struct WaitGroup {
    recv: Receiver<Never>,
}

/// Held by a task that is being waited for.
///
/// Cloning the guard registers one more waitee.
#[derive(Clone, Debug)]
pub(crate) struct WaitGuard {
    _send: Sender<Never>,
}

impl WaitGroup {
    /// Create a group and its first guard
    #[must_use]
    pub(crate) fn new() -> (Self, WaitGuard) {
        let (send, recv) = channel(1);
        (Self { recv }, WaitGuard { _send: send })
    }

    /// Resolve once every guard has been dropped
    pub(crate) async fn wait(mut self) {
        let None = self.recv.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::WaitGroup;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_all_guards() {
        let (group, guard) = WaitGroup::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 1..=3u64 {
            let guard = guard.clone();
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                drop(guard);
            });
        }
        drop(guard);

        group.wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_guard_blocks() {
        let (group, guard) = WaitGroup::new();
        let waited = tokio::time::timeout(Duration::from_millis(250), group.wait()).await;
        assert!(waited.is_err());
        drop(guard);
    }
}
