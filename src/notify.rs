//! Change notifications for queue and cache observers.
//!
//! Stores publish only after their persisted write has completed, so an
//! observer that re-reads on an event always sees the new state.

use tokio::sync::broadcast;
use tracing::debug;

/// What changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The durable queue was written; `pending` is its new total length
    QueueChanged { pending: usize },
    /// A cache entry was written or invalidated
    CacheChanged { collection: String, identity: String },
    /// All cache entries of an identity were dropped
    CacheInvalidated { identity: String },
}

/// Fan-out notifier shared by the queue and cache stores
#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn notify(&self, event: ChangeEvent) {
        // No receivers is fine
        if self.sender.send(event).is_err() {
            debug!("change event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the notifier is gone.
    ///
    /// A slow subscriber that falls behind skips the events it missed; it
    /// should treat any event as "re-read state".
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
