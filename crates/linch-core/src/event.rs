use std::sync::Arc;
use tokio::sync::broadcast;

/// A broadcast-based, typed event channel.
///
/// Each component owns one bus for its own event enum and hands out
/// receivers through its `subscribe()` method, so there is no ambient
/// global emitter.
pub struct EventBus<E> {
    sender: Arc<broadcast::Sender<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: E) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}
