/// Event bus - pub/sub fan-out for indexer events
///
/// In-process bus over a tokio broadcast channel. Subscribers filter on the
/// channel name carried by each event; sends to a bus nobody listens on are
/// dropped silently.

use tokio::sync::broadcast;
use tracing::trace;

use crate::events::BusEvent;

pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn notify(&self, event: BusEvent) {
        trace!(channel = event.channel(), "bus notify");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
