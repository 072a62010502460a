//! Broadcast event stream.
//!
//! Every lifecycle, worker and GPU event is published here after the state
//! change that produced it has been committed and its locks released.

use tokio::sync::broadcast;
use tracing::debug;

use mofsim_core::SchedulerEvent;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SchedulerEvent) {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => debug!(topic, receivers, "event published"),
            Err(_) => debug!(topic, "event dropped, no subscribers"),
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = SchedulerEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
