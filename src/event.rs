//! Event-driven communication system for inter-service messaging.

use anyhow::Result;
use tokio::sync::broadcast;

use crate::state::DevState;

/// Events exchanged between services.
#[derive(Debug, Clone)]
pub enum Event {
    /// A background poll finished; `failed` names the attributes whose
    /// sub-request failed.
    Polled { failed: Vec<String> },
    /// The derived device state or status changed.
    StateChanged { state: DevState, status: String },
    SystemShutdown,
}

/// Broadcast bus shared by all services.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Bus with a custom channel capacity.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event. Fails when nobody is subscribed.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
