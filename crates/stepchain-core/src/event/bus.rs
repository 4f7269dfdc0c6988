//! Fan-out of execution and step events.
//!
//! A runtime owns one bus and every execution context publishes into a clone
//! of it. Step progress, lifecycle transitions and step completions all pass
//! through here; the event logger and test assertions read them back.

use stepchain_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Sender half of the workflow event channel.
///
/// Clones share one channel, so branches forked for `and_all` or `and_race`
/// publish alongside their parent.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` bounds how far a subscriber may fall behind before it
    /// starts missing events. Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Send `event` to whoever is subscribed right now. An execution never
    /// waits on listeners; with none, the event is gone.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
