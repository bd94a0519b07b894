use crate::events::types::UploadEvent;
use tokio::sync::broadcast;

/// Typed publish/subscribe channel for upload events.
///
/// Publishing never blocks the engine. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: UploadEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("upload event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(256)
    }
}
