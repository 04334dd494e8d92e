//! Per-container internal pub/sub: process-state transitions and console
//! output. Distinct from the daemon-global Docker-style [`crate::events::EventBus`]
//! in `global.rs` — this one is consumed by the Container Manager's own
//! monitor/attach plumbing, not by `/events` subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Mirrors the container state machine's transient phases that matter to
/// in-process watchers (the Container record's durable `status` is the
/// source of truth; this is what a monitor task observes moment to moment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Offline,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Offline => write!(f, "offline"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
        }
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        ProcessState::Offline
    }
}

/// Events published on a single container's internal bus.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    StateChange(ProcessState),
    ConsoleOutput(Vec<u8>),
}

/// One bus per container instance, subscribed to by its monitor task and
/// any live `logs`/`attach` handler.
pub struct ContainerEvents {
    sender: broadcast::Sender<ContainerEvent>,
    _receiver: broadcast::Receiver<ContainerEvent>,
}

impl ContainerEvents {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ContainerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn publish_state(&self, state: ProcessState) -> usize {
        self.publish(ContainerEvent::StateChange(state))
    }

    pub fn publish_console(&self, data: Vec<u8>) -> usize {
        self.publish(ContainerEvent::ConsoleOutput(data))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ContainerEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ContainerEvents {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), _receiver: self.sender.subscribe() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pubsub_roundtrip() {
        let bus = ContainerEvents::new();
        let mut rx = bus.subscribe();
        bus.publish_state(ProcessState::Running);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ContainerEvent::StateChange(ProcessState::Running)));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = ContainerEvents::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish_state(ProcessState::Starting);
        assert!(matches!(rx1.recv().await.unwrap(), ContainerEvent::StateChange(ProcessState::Starting)));
        assert!(matches!(rx2.recv().await.unwrap(), ContainerEvent::StateChange(ProcessState::Starting)));
    }

    #[test]
    fn subscriber_count_tracks_live_receivers() {
        let bus = ContainerEvents::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn process_state_display() {
        assert_eq!(ProcessState::Offline.to_string(), "offline");
        assert_eq!(ProcessState::Running.to_string(), "running");
    }
}
