//! Client event stream.
//!
//! Session activity (connection transitions, streamed run output, failures)
//! fans out to subscribers over a broadcast channel. Emission never blocks
//! the session loop: events are delivered at most once, and a subscriber
//! that falls behind sees `RecvError::Lagged` rather than stalling the
//! connection.

use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;

/// An event observed on the gateway session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake completed and requests can be sent.
    Connected,

    /// The connection dropped or was closed.
    Disconnected,

    /// Incremental assistant text for an active run.
    Delta {
        /// Run the text belongs to.
        run_id: String,
        /// Conversation that started the run.
        conversation_id: String,
        /// New text fragment.
        delta: String,
        /// All text received for the run so far.
        accumulated: String,
    },

    /// A run completed.
    Response {
        /// Run that finished.
        run_id: String,
        /// Conversation that started the run.
        conversation_id: String,
        /// Full assistant response.
        text: String,
    },

    /// A run or the connection failed.
    Error {
        /// Failing run, or `None` for connection-level failures.
        run_id: Option<String>,
        /// Human-readable description.
        message: String,
    },
}

/// Fan-out of [`ClientEvent`]s to any number of subscribers.
///
/// Cheap to clone; all clones feed the same channel.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher with the default channel capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events emitted after this call.
    ///
    /// If the receiver falls behind it will receive
    /// `broadcast::error::RecvError::Lagged(n)` indicating how many
    /// events were missed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    ///
    /// Having no subscribers is not an error; the event is dropped.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_receives_events() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.subscribe();

        dispatcher.emit(ClientEvent::Connected);
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Connected);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let dispatcher = EventDispatcher::new();
        dispatcher.emit(ClientEvent::Disconnected);
    }

    #[test]
    fn test_all_subscribers_see_each_event() {
        let dispatcher = EventDispatcher::new();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        dispatcher.emit(ClientEvent::Error {
            run_id: Some("run-1".to_string()),
            message: "boom".to_string(),
        });

        let expected = ClientEvent::Error {
            run_id: Some("run-1".to_string()),
            message: "boom".to_string(),
        };
        assert_eq!(a.try_recv().unwrap(), expected);
        assert_eq!(b.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_subscription_starts_at_subscribe_time() {
        let dispatcher = EventDispatcher::new();
        dispatcher.emit(ClientEvent::Connected);

        let mut rx = dispatcher.subscribe();
        dispatcher.emit(ClientEvent::Disconnected);

        // Only the event emitted after subscribing is visible
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Disconnected);
        assert!(rx.try_recv().is_err());
    }
}
