//! Run lifecycle event distribution.
//!
//! Steps and the runner publish [`RunEvent`]s as a run progresses, and any
//! number of subscribers tap the feed. The bus is observability plumbing
//! only: the authoritative record of a run is its execution trace, and a
//! subscriber that falls behind loses old events rather than stalling the
//! run.

use procflow_types::event::RunEvent;
use tokio::sync::broadcast;

/// Fan-out channel for [`RunEvent`]s.
///
/// Clones share one underlying `tokio::sync::broadcast` channel, which is
/// how every step task and the runner publish into the same feed. A publish
/// with no subscribers is dropped silently.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a bus that retains up to `capacity` undelivered events per
    /// subscriber before the oldest are overwritten.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Open a subscription that sees every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to all current subscribers, if any.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.tx.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
