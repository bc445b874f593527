//! Gateway session loop.
//!
//! Owns the WebSocket lifecycle for one [`GatewayClient`](crate::client::GatewayClient):
//! dialing, the challenge/connect handshake, frame dispatch, keepalive,
//! request deadlines and reconnection with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//!   GatewayClient                    background session task
//!        │                                   │
//!        │  SessionCommand::SendMessage      │  run_session_loop
//!        │ ────────────────────────────────► │    ├── dial (bounded by CONNECT_TIMEOUT)
//!        │                                   │    ├── run_message_loop (select!)
//!        │  broadcast::Receiver<ClientEvent> │    │     ├── reader.recv()  → process_frame
//!        │ ◄──────────────────────────────── │    │     ├── command_rx     → chat.send
//!        │                                   │    │     ├── heartbeat tick → ping
//!        │                                   │    │     └── sweep tick     → deadlines
//!        │                                   │    └── wait_backoff, then redial
//! ```
//!
//! Pending requests and active runs live in the outer loop, so they survive
//! reconnections: a response that started streaming before a drop can finish
//! on the next connection. Inbound frames are processed one at a time on
//! this single task; no frame is handled concurrently with another.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Map;
use tokio::sync::{mpsc, RwLock};

use crate::auth::{self, AuthSignature};
use crate::backoff::ReconnectBackoff;
use crate::config::Config;
use crate::constants::{CONNECT_TIMEOUT, REQUEST_SWEEP_INTERVAL};
use crate::correlator::{RequestCorrelator, RequestKind, ResponseSender};
use crate::device::Device;
use crate::error::GatewayError;
use crate::events::{ClientEvent, EventDispatcher};
use crate::protocol::{
    self, ChallengePayload, ChatAck, ChatSendParams, ConnectAck, ConnectParams, Frame, RunUpdate,
    CLIENT_ID, CLIENT_MODE, EVENT_AGENT, EVENT_CHALLENGE, EVENT_CHAT, LOCALE, METHOD_CHAT_SEND,
    METHOD_CONNECT, PROTOCOL_MAX, PROTOCOL_MIN, ROLE, SCOPES,
};
use crate::runs::RunTracker;
use crate::ws;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Disconnected,
    /// Dialing the gateway.
    Connecting,
    /// Socket open, waiting for the `connect.challenge` event.
    AwaitingChallenge,
    /// Signed `connect` sent, waiting for the gateway's verdict.
    Authenticating,
    /// Handshake accepted; requests flow.
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Connection state observable from outside the session task.
#[derive(Debug, Default)]
pub struct SharedConnectionState {
    state: RwLock<ConnectionState>,
}

impl SharedConnectionState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub async fn get(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Set the state.
    pub async fn set(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }

    /// Check if the handshake has completed.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Connected)
    }
}

/// Command sent from the client handle to the session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a chat message and answer `responder` with the final text.
    SendMessage {
        /// Message text.
        text: String,
        /// Conversation the message belongs to.
        conversation_id: String,
        /// Channel the final response or error is delivered on.
        responder: ResponseSender,
    },
    /// Close the connection and end the session task.
    Disconnect,
}

/// Everything the session task owns for its lifetime.
pub struct SessionContext {
    /// Client configuration.
    pub config: Config,
    /// Device identity used for handshake signing.
    pub device: Device,
    /// State mirror read by the client handle.
    pub state: Arc<SharedConnectionState>,
    /// Event fan-out to subscribers.
    pub events: EventDispatcher,
    /// Set by the client handle to stop the task.
    pub shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("gateway_url", &self.config.gateway_url)
            .field("device", &self.device)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// Why the per-connection message loop returned.
enum SessionExit {
    /// Shutdown or disconnect was requested; end the session task.
    Shutdown,
    /// Connection was lost; reconnect after backoff.
    Disconnected,
}

/// Result of processing one inbound text frame.
enum FrameOutcome {
    /// Keep going.
    Continue,
    /// Send this text frame to the gateway.
    Reply(String),
    /// Drop the connection and reconnect.
    Disconnect,
}

/// Outcome of a backoff wait.
enum WaitResult {
    /// The delay elapsed; dial again.
    Elapsed,
    /// Shutdown was requested during the wait.
    Shutdown,
}

/// Main session loop with reconnection.
///
/// Runs until shutdown is requested or every client handle is dropped.
pub async fn run_session_loop(
    mut ctx: SessionContext,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let mut backoff = ReconnectBackoff::from_config(&ctx.config);
    // Pending requests and live runs persist across reconnections
    let mut correlator = RequestCorrelator::new();
    let mut runs = RunTracker::new();

    let url = ws::http_to_ws_scheme(&ctx.config.gateway_url);

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            log::info!("[Gateway] Shutdown requested, exiting session loop");
            break;
        }

        ctx.state.set(ConnectionState::Connecting).await;
        log::info!("[Gateway] Connecting to {}", url);

        let dialed = tokio::time::timeout(CONNECT_TIMEOUT, ws::connect(&url)).await;
        let (mut writer, mut reader) = match dialed {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                log::warn!("[Gateway] Connection failed: {}", e);
                ctx.state.set(ConnectionState::Disconnected).await;
                ctx.events.emit(ClientEvent::Disconnected);
                match wait_backoff(&ctx, &mut backoff, &mut correlator, &mut runs, &mut command_rx)
                    .await
                {
                    WaitResult::Elapsed => continue,
                    WaitResult::Shutdown => break,
                }
            }
            Err(_) => {
                log::warn!(
                    "[Gateway] Connection attempt timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                );
                ctx.state.set(ConnectionState::Disconnected).await;
                ctx.events.emit(ClientEvent::Disconnected);
                match wait_backoff(&ctx, &mut backoff, &mut correlator, &mut runs, &mut command_rx)
                    .await
                {
                    WaitResult::Elapsed => continue,
                    WaitResult::Shutdown => break,
                }
            }
        };

        log::info!("[Gateway] WebSocket open, waiting for challenge");
        ctx.state.set(ConnectionState::AwaitingChallenge).await;

        let exit = run_message_loop(
            &mut ctx,
            &mut correlator,
            &mut runs,
            &mut backoff,
            &mut writer,
            &mut reader,
            &mut command_rx,
        )
        .await;

        ctx.state.set(ConnectionState::Disconnected).await;
        ctx.events.emit(ClientEvent::Disconnected);

        match exit {
            SessionExit::Shutdown => break,
            SessionExit::Disconnected => {
                match wait_backoff(&ctx, &mut backoff, &mut correlator, &mut runs, &mut command_rx)
                    .await
                {
                    WaitResult::Elapsed => {}
                    WaitResult::Shutdown => break,
                }
            }
        }
    }

    ctx.state.set(ConnectionState::Disconnected).await;
    log::info!("[Gateway] Session loop ended");
    // Dropping the correlator closes every pending responder, waking
    // callers with a channel error instead of leaving them hanging
}

/// Sleep out the reconnect delay while still servicing callers.
///
/// Commands arriving during the wait are rejected with
/// [`GatewayError::NotConnected`] rather than queued, and request
/// deadlines keep being enforced.
async fn wait_backoff(
    ctx: &SessionContext,
    backoff: &mut ReconnectBackoff,
    correlator: &mut RequestCorrelator,
    runs: &mut RunTracker,
    command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> WaitResult {
    let delay = backoff.next_delay();
    log::info!("[Gateway] Reconnecting in {}ms", delay.as_millis());

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    let mut sweep = tokio::time::interval(REQUEST_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = &mut sleep => return WaitResult::Elapsed,

            cmd = command_rx.recv() => match cmd {
                Some(SessionCommand::SendMessage { responder, .. }) => {
                    let _ = responder.send(Err(GatewayError::NotConnected));
                }
                Some(SessionCommand::Disconnect) | None => return WaitResult::Shutdown,
            },

            _ = sweep.tick() => {
                if ctx.shutdown.load(Ordering::SeqCst) {
                    return WaitResult::Shutdown;
                }
                sweep_requests(ctx, correlator, runs);
            }
        }
    }
}

/// Inner message loop for a single WebSocket connection.
///
/// Serializes all inbound frame handling on this task, services caller
/// commands, sends keepalive pings and enforces request deadlines.
/// Returns when the connection is lost or shutdown is requested.
async fn run_message_loop(
    ctx: &mut SessionContext,
    correlator: &mut RequestCorrelator,
    runs: &mut RunTracker,
    backoff: &mut ReconnectBackoff,
    writer: &mut ws::WsWriter,
    reader: &mut ws::WsReader,
    command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> SessionExit {
    let mut phase = ConnectionState::AwaitingChallenge;

    // A zero interval disables keepalive; park the timer on a day so the
    // select arm stays valid
    let heartbeat_period = if ctx.config.heartbeat_interval_ms == 0 {
        std::time::Duration::from_secs(86_400)
    } else {
        ctx.config.heartbeat_interval()
    };
    let mut heartbeat = tokio::time::interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Absorb the interval's immediate first tick so the first ping waits
    // a full period
    heartbeat.tick().await;

    let mut sweep = tokio::time::interval(REQUEST_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            log::info!("[Gateway] Shutdown requested, closing connection");
            let _ = writer.close().await;
            return SessionExit::Shutdown;
        }

        tokio::select! {
            msg = reader.recv() => {
                match msg {
                    Some(Ok(ws::WsMessage::Text(text))) => {
                        match process_frame(ctx, &text, &mut phase, correlator, runs, backoff).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Reply(reply) => {
                                if let Err(e) = writer.send_text(&reply).await {
                                    log::warn!("[Gateway] Failed to send frame: {}", e);
                                    return SessionExit::Disconnected;
                                }
                            }
                            FrameOutcome::Disconnect => return SessionExit::Disconnected,
                        }
                    }
                    Some(Ok(ws::WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                    }
                    Some(Ok(ws::WsMessage::Pong(_))) => {
                        log::trace!("[Gateway] Keepalive pong received");
                    }
                    Some(Ok(ws::WsMessage::Binary(_))) => {
                        log::trace!("[Gateway] Ignoring unexpected binary frame");
                    }
                    Some(Ok(ws::WsMessage::Close { code, reason })) => {
                        log::info!("[Gateway] Connection closed ({}): {}", code, reason);
                        return SessionExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Gateway] WebSocket error: {}", e);
                        return SessionExit::Disconnected;
                    }
                    None => {
                        log::info!("[Gateway] WebSocket stream ended");
                        return SessionExit::Disconnected;
                    }
                }
            }

            cmd = command_rx.recv() => match cmd {
                Some(SessionCommand::SendMessage { text, conversation_id, responder }) => {
                    if phase != ConnectionState::Connected {
                        let _ = responder.send(Err(GatewayError::NotConnected));
                        continue;
                    }
                    let params = ChatSendParams {
                        session_key: protocol::SESSION_KEY.to_string(),
                        message: text,
                        idempotency_key: protocol::idempotency_key(&conversation_id),
                    };
                    let id = correlator.register(
                        RequestKind::Chat { conversation_id },
                        Some(responder),
                    );
                    let frame = match Frame::req(id.clone(), METHOD_CHAT_SEND, &params)
                        .and_then(|f| serde_json::to_string(&f))
                    {
                        Ok(frame) => frame,
                        Err(e) => {
                            correlator.reject(&id, GatewayError::Protocol(e.to_string()));
                            continue;
                        }
                    };
                    log::debug!("[Gateway] Sending chat.send ({})", id);
                    if let Err(e) = writer.send_text(&frame).await {
                        log::warn!("[Gateway] Failed to send chat.send: {}", e);
                        correlator.reject(&id, GatewayError::Transport(e.to_string()));
                        return SessionExit::Disconnected;
                    }
                }
                Some(SessionCommand::Disconnect) => {
                    log::info!("[Gateway] Disconnect requested, closing connection");
                    let _ = writer.send_close().await;
                    return SessionExit::Shutdown;
                }
                None => {
                    // Every client handle is gone
                    let _ = writer.send_close().await;
                    return SessionExit::Shutdown;
                }
            },

            _ = heartbeat.tick() => {
                if let Err(e) = writer.send_ping(Vec::new()).await {
                    log::warn!("[Gateway] Keepalive ping failed: {}", e);
                    return SessionExit::Disconnected;
                }
            }

            _ = sweep.tick() => {
                if sweep_requests(ctx, correlator, runs) {
                    // The handshake itself timed out; this connection is dead
                    return SessionExit::Disconnected;
                }
            }
        }
    }
}

/// Handle one inbound text frame.
async fn process_frame(
    ctx: &mut SessionContext,
    text: &str,
    phase: &mut ConnectionState,
    correlator: &mut RequestCorrelator,
    runs: &mut RunTracker,
    backoff: &mut ReconnectBackoff,
) -> FrameOutcome {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            // Byte 100 can fall inside a multi-byte char; fall back to
            // the whole frame rather than slice it
            log::warn!(
                "[Gateway] Failed to parse frame: {}",
                text.get(..100).unwrap_or(text)
            );
            return FrameOutcome::Continue;
        }
    };

    match frame {
        Frame::Event { event, payload, rest } => match event.as_str() {
            EVENT_CHALLENGE => {
                let nonce = ChallengePayload::deserialize(&payload)
                    .ok()
                    .and_then(|c| c.nonce)
                    .unwrap_or_default();
                log::info!("[Gateway] Received challenge, sending signed connect");

                // A connect request from an earlier attempt can no longer
                // be answered meaningfully
                correlator.remove_handshakes();

                let token = effective_token(ctx);
                let signature = auth::sign_connect(&ctx.device, &token, &nonce);
                let params = build_connect_params(&ctx.device, token, signature, nonce);
                let id = correlator.register(RequestKind::Handshake, None);

                match Frame::req(id, METHOD_CONNECT, &params)
                    .and_then(|f| serde_json::to_string(&f))
                {
                    Ok(reply) => {
                        set_phase(ctx, phase, ConnectionState::Authenticating).await;
                        FrameOutcome::Reply(reply)
                    }
                    Err(e) => {
                        log::error!("[Gateway] Failed to build connect request: {}", e);
                        FrameOutcome::Disconnect
                    }
                }
            }
            EVENT_AGENT => {
                if let Some(run_event) = protocol::normalize_agent_event(&payload, &rest) {
                    apply_run_event(ctx, correlator, runs, run_event);
                }
                FrameOutcome::Continue
            }
            EVENT_CHAT => {
                if let Some(run_event) = protocol::normalize_chat_event(&payload) {
                    apply_run_event(ctx, correlator, runs, run_event);
                }
                FrameOutcome::Continue
            }
            other => {
                log::trace!("[Gateway] Unhandled event: {}", other);
                FrameOutcome::Continue
            }
        },

        Frame::Res { id, ok, payload, error } => match correlator.kind_of(&id) {
            None => {
                log::debug!("[Gateway] Response for unknown request {}", id);
                FrameOutcome::Continue
            }
            Some(RequestKind::Handshake) => {
                correlator.take(&id);
                if ok {
                    log::info!("[Gateway] Connected successfully");
                    backoff.reset();
                    store_device_token(ctx, &payload);
                    set_phase(ctx, phase, ConnectionState::Connected).await;
                    ctx.events.emit(ClientEvent::Connected);
                    FrameOutcome::Continue
                } else {
                    let message =
                        GatewayError::Auth(protocol::error_message(&error, "Connect rejected"))
                            .to_string();
                    log::error!("[Gateway] {}", message);
                    ctx.events.emit(ClientEvent::Error {
                        run_id: None,
                        message,
                    });
                    FrameOutcome::Disconnect
                }
            }
            Some(RequestKind::Chat { conversation_id }) => {
                if ok {
                    let conversation_id = conversation_id.clone();
                    // The caller is answered when the run finishes, not by
                    // this acknowledgment; only start tracking the run
                    if let Ok(ack) = ChatAck::deserialize(&payload) {
                        if let Some(run_id) = ack.resolved_run_id() {
                            log::debug!("[Gateway] Request {} acknowledged as run {}", id, run_id);
                            runs.insert(run_id.to_string(), id.clone(), conversation_id);
                        }
                    }
                } else {
                    let message = protocol::error_message(&error, "Request failed");
                    log::error!("[Gateway] chat.send failed: {}", message);
                    correlator.reject(&id, GatewayError::Request(message));
                    runs.remove_for_request(&id);
                }
                FrameOutcome::Continue
            }
        },

        Frame::Req { method, .. } => {
            log::trace!("[Gateway] Ignoring inbound request frame: {}", method);
            FrameOutcome::Continue
        }
    }
}

/// Apply a normalized run event: update trackers, answer callers, emit.
fn apply_run_event(
    ctx: &SessionContext,
    correlator: &mut RequestCorrelator,
    runs: &mut RunTracker,
    run_event: protocol::RunEvent,
) {
    for update in run_event.updates {
        match update {
            RunUpdate::Delta(delta) => {
                if let Some(progress) = runs.apply_delta(&run_event.run_id, &delta, correlator) {
                    ctx.events.emit(ClientEvent::Delta {
                        run_id: run_event.run_id.clone(),
                        conversation_id: progress.conversation_id,
                        delta,
                        accumulated: progress.accumulated,
                    });
                }
            }
            RunUpdate::End => {
                if let Some(done) = runs.complete(&run_event.run_id, correlator) {
                    log::debug!(
                        "[Gateway] Run {} finished ({} chars)",
                        run_event.run_id,
                        done.text.len()
                    );
                    correlator.resolve(&done.request_id, done.text.clone());
                    ctx.events.emit(ClientEvent::Response {
                        run_id: run_event.run_id.clone(),
                        conversation_id: done.conversation_id,
                        text: done.text,
                    });
                }
            }
            RunUpdate::Error(message) => {
                if let Some(done) = runs.complete(&run_event.run_id, correlator) {
                    log::warn!("[Gateway] Run {} failed: {}", run_event.run_id, message);
                    correlator.reject(&done.request_id, GatewayError::Run(message.clone()));
                    ctx.events.emit(ClientEvent::Error {
                        run_id: Some(run_event.run_id.clone()),
                        message,
                    });
                }
            }
        }
    }
}

/// Enforce the per-request deadline.
///
/// Rejects expired chat requests (and drops their runs). Returns `true`
/// when the pending handshake itself expired.
fn sweep_requests(
    ctx: &SessionContext,
    correlator: &mut RequestCorrelator,
    runs: &mut RunTracker,
) -> bool {
    let Some(timeout) = ctx.config.request_timeout() else {
        return false;
    };

    let mut handshake_expired = false;
    for id in correlator.expired(timeout) {
        if let Some(pending) = correlator.take(&id) {
            match pending.kind {
                RequestKind::Handshake => {
                    log::warn!("[Gateway] Handshake timed out");
                    handshake_expired = true;
                }
                RequestKind::Chat { .. } => {
                    log::warn!("[Gateway] Request {} timed out", id);
                    pending.respond(Err(GatewayError::Timeout));
                    runs.remove_for_request(&id);
                }
            }
        }
    }
    handshake_expired
}

/// Update the loop-local phase and its shared mirror together.
async fn set_phase(ctx: &SessionContext, phase: &mut ConnectionState, next: ConnectionState) {
    log::debug!("[Gateway] State {:?} -> {:?}", phase, next);
    *phase = next;
    ctx.state.set(next).await;
}

/// Token to present to the gateway: an explicitly configured token wins
/// over the persisted device token.
fn effective_token(ctx: &SessionContext) -> String {
    if ctx.config.auth_token.is_empty() {
        ctx.device.device_token().unwrap_or_default().to_string()
    } else {
        ctx.config.auth_token.clone()
    }
}

/// Persist the device token from a successful handshake, if one was issued.
fn store_device_token(ctx: &mut SessionContext, payload: &serde_json::Value) {
    let token = ConnectAck::deserialize(payload)
        .ok()
        .and_then(|ack| ack.auth)
        .and_then(|auth| auth.device_token);
    if let Some(token) = token {
        match ctx.device.set_device_token(token) {
            Ok(()) => log::info!("[Gateway] Device token stored"),
            Err(e) => log::warn!("[Gateway] Failed to persist device token: {}", e),
        }
    }
}

/// Build the `connect` request parameters around a fresh signature.
fn build_connect_params(
    device: &Device,
    token: String,
    signature: AuthSignature,
    nonce: String,
) -> ConnectParams {
    ConnectParams {
        min_protocol: PROTOCOL_MIN,
        max_protocol: PROTOCOL_MAX,
        client: protocol::ClientInfo {
            id: CLIENT_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: CLIENT_MODE.to_string(),
        },
        role: ROLE.to_string(),
        scopes: SCOPES.iter().map(ToString::to_string).collect(),
        caps: Vec::new(),
        commands: Vec::new(),
        permissions: Map::new(),
        auth: protocol::AuthToken { token },
        locale: LOCALE.to_string(),
        user_agent: protocol::user_agent(),
        device: protocol::DeviceAuth {
            id: device.device_id.clone(),
            public_key: signature.public_key,
            signature: signature.signature,
            signed_at: signature.signed_at,
            nonce,
        },
    }
}
