//! Error taxonomy for gateway operations.
//!
//! Failures are recoverable at connection or per-request granularity --
//! none of these abort the process. Transport-level failures drive
//! reconnection and are never surfaced on individual requests; the
//! remaining variants reject exactly one pending request each.

/// Errors surfaced by gateway client operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// A request was issued while the session was not connected.
    ///
    /// Requests are never queued while offline; callers retry after
    /// observing a `Connected` event.
    NotConnected,
    /// Opening, writing to, or closing the underlying connection failed.
    Transport(String),
    /// A frame could not be parsed or violated the envelope contract.
    Protocol(String),
    /// The authentication handshake was rejected by the gateway.
    Auth(String),
    /// The gateway answered a business request with `ok=false`.
    Request(String),
    /// A run ended with a lifecycle error event.
    Run(String),
    /// The per-request deadline elapsed before resolution.
    Timeout,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected to gateway"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Auth(msg) => write!(f, "Authentication rejected: {msg}"),
            Self::Request(msg) => write!(f, "Request failed: {msg}"),
            Self::Run(msg) => write!(f, "Run failed: {msg}"),
            Self::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = GatewayError::Auth("device not trusted".to_string());
        assert_eq!(err.to_string(), "Authentication rejected: device not trusted");

        let err = GatewayError::Request("bad params".to_string());
        assert!(err.to_string().contains("bad params"));
    }

    #[test]
    fn not_connected_matches_wording() {
        assert_eq!(
            GatewayError::NotConnected.to_string(),
            "Not connected to gateway"
        );
    }
}
