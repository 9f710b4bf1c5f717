use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tmuxpilot_core::domain::{Notification, Session, Ticket};

/// Default broadcast channel capacity. Generous enough to absorb a burst of
/// topology changes without a slow subscriber lagging on the very next tick.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Every externally-relevant thing that happens inside the daemon, in one
/// flat enum so every component publishes to and every transport consumes
/// from a single broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStarted { session: Session },
    SessionUpdated { session: Session },
    SessionEnded { session_id: String },
    ContextPercentUpdated { session_id: String, context_percent: u8 },
    WaitingStateChanged { session_id: String, is_waiting: bool, reason: String },
    TicketChanged { ticket: Ticket },
    NotificationCreated { notification: Notification },
    HandoffStarted { session_id: String, ticket_id: String },
    /// Emitted once per state-machine transition during a handoff (e.g.
    /// `exporting`, `waiting_file`, `importing`) so subscribers can show
    /// live progress rather than only a terminal started/completed/failed.
    HandoffProgress { session_id: String, ticket_id: String, state: String, message: String },
    HandoffCompleted { session_id: String, ticket_id: String, child_session_id: String },
    HandoffFailed { session_id: String, ticket_id: String, reason: String, session_preserved: bool },
    ReviewStarted { session_id: String, ticket_id: String },
    ReviewCompleted { session_id: String, ticket_id: String, decision: String, reasoning: String },
    ReviewFailed { session_id: String, ticket_id: String, reason: String },
    /// New pane output lines, used by the fan-out hub's terminal stream.
    /// Excluded from the PTY-bridge subscriber path (see the hub) since a
    /// PTY consumer reads raw bytes directly from its own bridge.
    PaneOutput { session_id: String, lines: Vec<String> },
}

/// Thin typed wrapper around a broadcast channel. Cloning an `EventBus`
/// clones the sender handle; every clone publishes onto the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // Publishing is fire-and-forget: a send error only means there are
        // currently no subscribers, which is routine during startup/shutdown.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::SessionEnded {
            session_id: "s1".into(),
        });

        let got1 = rx1.recv().await.unwrap();
        let got2 = rx2.recv().await.unwrap();
        assert!(matches!(got1, Event::SessionEnded { session_id } if session_id == "s1"));
        assert!(matches!(got2, Event::SessionEnded { session_id } if session_id == "s1"));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(Event::SessionEnded {
            session_id: "s1".into(),
        });
    }
}
