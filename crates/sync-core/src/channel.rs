use tokio::sync::broadcast;

use crate::types::SyncEvent;

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Fan-out bus the facades publish [`SyncEvent`]s on.
#[derive(Clone, Debug)]
pub struct SyncEventBus {
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    /// Create a bus retaining up to `buffer` undelivered events per subscriber.
    pub fn new(buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer.max(1));
        Self { event_tx }
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
