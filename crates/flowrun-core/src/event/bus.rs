//! Fan-out of `RunEvent`s to observers of the run loops.
//!
//! A thin wrapper over a `tokio::sync::broadcast` channel. Run loops publish
//! after each persisted change and never wait on observers: with nobody
//! listening the event is dropped, and a slow observer lags instead of
//! holding up the loop.

use flowrun_types::event::RunEvent;
use tokio::sync::broadcast;

/// Shared sender side of the run event channel. Clones publish into the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// `capacity` is how many events a receiver may fall behind before it
    /// lags; zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        // Err only means nobody is subscribed.
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}
