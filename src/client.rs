//! Public client handle.
//!
//! [`GatewayClient::connect`] spawns the background session task and
//! returns immediately; the handshake and any later reconnections happen
//! behind the handle. Callers send messages with [`GatewayClient::send_message`]
//! and watch connection and streaming activity via [`GatewayClient::subscribe`].

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::Config;
use crate::device::Device;
use crate::error::GatewayError;
use crate::events::{ClientEvent, EventDispatcher};
use crate::session::{
    self, ConnectionState, SessionCommand, SessionContext, SharedConnectionState,
};

/// Handle to a gateway session.
///
/// Dropping the handle stops the background task and closes the
/// connection.
#[derive(Debug)]
pub struct GatewayClient {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    shutdown: Arc<AtomicBool>,
    state: Arc<SharedConnectionState>,
    events: EventDispatcher,
}

impl GatewayClient {
    /// Load the device identity and start the session task.
    ///
    /// Returns as soon as the task is spawned; connection progress is
    /// visible through [`GatewayClient::state`] and the event stream.
    /// Fails only when the device identity cannot be loaded or created.
    pub fn connect(config: Config) -> Result<Self> {
        let device = Device::load_or_create()?;
        log::info!(
            "[Gateway] Using device {} ({})",
            device.short_id(),
            config.gateway_url
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = SharedConnectionState::new();
        let events = EventDispatcher::new();

        let ctx = SessionContext {
            config,
            device,
            state: Arc::clone(&state),
            events: events.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        tokio::spawn(session::run_session_loop(ctx, command_rx));

        Ok(Self {
            command_tx,
            shutdown,
            state,
            events,
        })
    }

    /// Send a chat message and wait for the complete response text.
    ///
    /// Resolves once the gateway finishes streaming the run this message
    /// started. Fails fast with [`GatewayError::NotConnected`] when no
    /// authenticated connection is up.
    pub async fn send_message(
        &self,
        text: &str,
        conversation_id: &str,
    ) -> Result<String, GatewayError> {
        let (responder, answer) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::SendMessage {
                text: text.to_string(),
                conversation_id: conversation_id.to_string(),
                responder,
            })
            .map_err(|_| GatewayError::NotConnected)?;
        answer.await.map_err(|_| GatewayError::NotConnected)?
    }

    /// Subscribe to connection and streaming events.
    ///
    /// Each subscriber gets every event from the moment it subscribes;
    /// slow subscribers miss the oldest events once the channel fills.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.state.get().await
    }

    /// Whether the handshake has completed on a live connection.
    pub async fn is_connected(&self) -> bool {
        self.state.is_connected().await
    }

    /// Close the connection and stop the session task.
    ///
    /// Idempotent. Pending requests are failed rather than left hanging.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(SessionCommand::Disconnect);
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> Config {
        Config {
            // Nothing listens on the discard port; dialing fails at once
            gateway_url: "ws://127.0.0.1:9".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn send_message_fails_fast_while_disconnected() {
        let client = GatewayClient::connect(unreachable_config()).unwrap();
        let result = client.send_message("hello", "conv-1").await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_ends_the_session() {
        let client = GatewayClient::connect(unreachable_config()).unwrap();
        client.disconnect();
        client.disconnect();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        let result = client.send_message("hello", "conv-1").await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn state_starts_out_disconnected_or_dialing() {
        let client = GatewayClient::connect(unreachable_config()).unwrap();
        let state = client.state().await;
        assert_ne!(state, ConnectionState::Connected);
        assert!(!client.is_connected().await);
    }
}
