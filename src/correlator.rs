//! Request correlation.
//!
//! Outbound requests carry a unique ID that the gateway echoes in its
//! response frame. [`RequestCorrelator`] owns the map from those IDs to the
//! callers waiting on them. Entries survive reconnects: a response can
//! legitimately arrive on a different connection than its request left on.
//! The session loop sweeps the map against the configured deadline so an
//! answer that never comes fails the caller instead of hanging it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::GatewayError;
use crate::protocol;

/// Channel half used to answer a waiting caller.
pub type ResponseSender = oneshot::Sender<Result<String, GatewayError>>;

/// What a pending request is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// The signed `connect` handshake. Nothing external awaits it; the
    /// session loop itself reacts to the response.
    Handshake,
    /// A `chat.send` request started by a caller.
    Chat {
        /// Conversation the message belongs to.
        conversation_id: String,
    },
}

impl RequestKind {
    /// Conversation ID for chat requests.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Handshake => None,
            Self::Chat { conversation_id } => Some(conversation_id),
        }
    }
}

/// A request awaiting its response frame.
#[derive(Debug)]
pub struct PendingRequest {
    /// What the request is for.
    pub kind: RequestKind,
    /// Caller to answer, absent for the handshake.
    pub responder: Option<ResponseSender>,
    /// When the request was registered.
    pub sent_at: Instant,
}

impl PendingRequest {
    /// Answer the waiting caller, if any. A caller that stopped waiting
    /// is not an error.
    pub fn respond(self, result: Result<String, GatewayError>) {
        if let Some(responder) = self.responder {
            let _ = responder.send(result);
        }
    }
}

/// Map of in-flight requests keyed by request ID.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, PendingRequest>,
}

impl RequestCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return its freshly generated ID.
    ///
    /// IDs embed a timestamp and random suffix; on the off chance of a
    /// collision with an in-flight request a new one is generated.
    pub fn register(&mut self, kind: RequestKind, responder: Option<ResponseSender>) -> String {
        let mut id = protocol::request_id();
        while self.pending.contains_key(&id) {
            id = protocol::request_id();
        }
        self.pending.insert(
            id.clone(),
            PendingRequest {
                kind,
                responder,
                sent_at: Instant::now(),
            },
        );
        id
    }

    /// Kind of a pending request, if the ID is known.
    pub fn kind_of(&self, id: &str) -> Option<&RequestKind> {
        self.pending.get(id).map(|p| &p.kind)
    }

    /// Remove and return a pending request.
    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.pending.remove(id)
    }

    /// Resolve a pending request with the final response text.
    ///
    /// Returns `false` when the ID is unknown (already answered or swept).
    pub fn resolve(&mut self, id: &str, text: String) -> bool {
        match self.pending.remove(id) {
            Some(pending) => {
                pending.respond(Ok(text));
                true
            }
            None => false,
        }
    }

    /// Fail a pending request.
    ///
    /// Returns `false` when the ID is unknown.
    pub fn reject(&mut self, id: &str, error: GatewayError) -> bool {
        match self.pending.remove(id) {
            Some(pending) => {
                pending.respond(Err(error));
                true
            }
            None => false,
        }
    }

    /// The earliest-registered chat request, as `(request_id, conversation_id)`.
    ///
    /// Used to adopt a run the gateway started without naming the request
    /// it belongs to.
    pub fn oldest_pending_chat(&self) -> Option<(String, String)> {
        self.pending
            .iter()
            .filter_map(|(id, pending)| {
                pending
                    .kind
                    .conversation_id()
                    .map(|conversation| (id, conversation, pending.sent_at))
            })
            .min_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(b.0)))
            .map(|(id, conversation, _)| (id.clone(), conversation.to_string()))
    }

    /// IDs of requests older than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, pending)| pending.sent_at.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop any pending handshakes.
    ///
    /// Called when a new challenge arrives: a connect request from an
    /// earlier attempt can no longer be answered meaningfully.
    pub fn remove_handshakes(&mut self) {
        self.pending
            .retain(|_, pending| pending.kind != RequestKind::Handshake);
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(conversation: &str) -> RequestKind {
        RequestKind::Chat {
            conversation_id: conversation.to_string(),
        }
    }

    #[test]
    fn register_produces_unique_ids() {
        let mut correlator = RequestCorrelator::new();
        let a = correlator.register(chat("conv-1"), None);
        let b = correlator.register(chat("conv-1"), None);
        assert_ne!(a, b);
        assert_eq!(correlator.len(), 2);
    }

    #[test]
    fn resolve_answers_the_caller() {
        let mut correlator = RequestCorrelator::new();
        let (tx, mut rx) = oneshot::channel();
        let id = correlator.register(chat("conv-1"), Some(tx));

        assert!(correlator.resolve(&id, "final text".to_string()));
        assert_eq!(rx.try_recv().unwrap().unwrap(), "final text");
        assert!(correlator.is_empty());
    }

    #[test]
    fn reject_delivers_the_error() {
        let mut correlator = RequestCorrelator::new();
        let (tx, mut rx) = oneshot::channel();
        let id = correlator.register(chat("conv-1"), Some(tx));

        assert!(correlator.reject(&id, GatewayError::Timeout));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(GatewayError::Timeout)
        ));
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut correlator = RequestCorrelator::new();
        assert!(!correlator.resolve("req-0-missing", String::new()));
        assert!(!correlator.reject("req-0-missing", GatewayError::Timeout));
        assert!(correlator.kind_of("req-0-missing").is_none());
    }

    #[test]
    fn oldest_pending_chat_skips_handshakes() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(RequestKind::Handshake, None);
        let first = correlator.register(chat("conv-early"), None);
        std::thread::sleep(Duration::from_millis(2));
        correlator.register(chat("conv-late"), None);

        let (id, conversation) = correlator.oldest_pending_chat().unwrap();
        assert_eq!(id, first);
        assert_eq!(conversation, "conv-early");
    }

    #[test]
    fn expired_finds_old_requests() {
        let mut correlator = RequestCorrelator::new();
        let old = correlator.register(chat("conv-1"), None);
        std::thread::sleep(Duration::from_millis(10));
        let fresh = correlator.register(chat("conv-2"), None);

        let expired = correlator.expired(Duration::from_millis(5));
        assert!(expired.contains(&old));
        assert!(!expired.contains(&fresh));
    }

    #[test]
    fn remove_handshakes_keeps_chats() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(RequestKind::Handshake, None);
        let chat_id = correlator.register(chat("conv-1"), None);

        correlator.remove_handshakes();
        assert_eq!(correlator.len(), 1);
        assert!(correlator.kind_of(&chat_id).is_some());
    }

    #[test]
    fn dropping_the_correlator_wakes_waiters() {
        let (tx, mut rx) = oneshot::channel();
        let mut correlator = RequestCorrelator::new();
        correlator.register(chat("conv-1"), Some(tx));

        drop(correlator);
        // The caller sees a closed channel rather than hanging forever
        assert!(rx.try_recv().is_err());
    }
}
