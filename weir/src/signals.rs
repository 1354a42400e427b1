//! Cooperative shutdown signaling.
//!
//! The listener's socket wait blocks indefinitely and must be interruptible
//! for shutdown. Everything that participates in controlled shutdown holds
//! a clone of [`Shutdown`]; the engine signals once and every clone's
//! `recv` resolves, including clones created or polled after the fact.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::broadcast;

#[derive(Debug)]
/// Mechanism to coordinate shutdown across tasks.
pub struct Shutdown {
    /// The broadcast sender, singleton for all `Shutdown` instances derived
    /// from the same root.
    sender: Arc<broadcast::Sender<()>>,
    /// The receive half used to listen for the signal. One per instance.
    notify: broadcast::Receiver<()>,
    /// Set before the broadcast goes out, so clones that subscribe after
    /// the send still observe the signal.
    signaled: Arc<AtomicBool>,
    /// `true` once the signal has been received by this instance.
    received: bool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a new root `Shutdown`.
    #[must_use]
    pub fn new() -> Self {
        let (sender, notify) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
            notify,
            signaled: Arc::new(AtomicBool::new(false)),
            received: false,
        }
    }

    /// Send the shutdown signal to every clone. Idempotent: later calls,
    /// and calls with no live listeners, are harmless.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        // A send error means every receiver is already gone, which is a
        // completed shutdown, not a failure.
        let _ = self.sender.send(());
    }

    /// Wait for the shutdown signal. Returns immediately on every call
    /// after the signal has been sent.
    pub async fn recv(&mut self) {
        if self.received || self.signaled.load(Ordering::SeqCst) {
            self.received = true;
            // When called from inside a `select!` loop an immediate return
            // would drown out every other arm; give the scheduler a chance.
            tokio::task::yield_now().await;
            return;
        }
        // Closed means the last sender dropped without sending, which only
        // happens at teardown; treat it as the signal. Lagged is impossible
        // on a one-slot channel carrying a single message.
        match self.notify.recv().await {
            Ok(())
            | Err(broadcast::error::RecvError::Closed | broadcast::error::RecvError::Lagged(_)) => {
                self.received = true;
            }
        }
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            notify: self.sender.subscribe(),
            signaled: Arc::clone(&self.signaled),
            received: self.received,
        }
    }
}
