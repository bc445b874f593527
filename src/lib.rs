//! OpenClaw gateway client.
//!
//! This crate provides a persistent, authenticated client for an OpenClaw
//! agent gateway: one WebSocket connection multiplexing signed handshakes,
//! chat requests and streamed agent responses.
//!
//! # Architecture
//!
//! The crate follows a handle-plus-task pattern:
//!
//! - **GatewayClient** - Public handle, sends commands, exposes events
//! - **Session** - Background task owning the socket, handshake and reconnect loop
//! - **Correlator / Runs** - Request and run bookkeeping that outlives reconnects
//! - **Device** - Persistent Ed25519 identity used to sign the handshake
//!
//! # Modules
//!
//! - [`client`] - Public [`GatewayClient`] handle
//! - [`session`] - Connection state machine and message loop
//! - [`protocol`] - Wire frames and event normalization
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod runs;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use client::GatewayClient;
pub use config::Config;
pub use device::Device;
pub use error::GatewayError;
pub use events::ClientEvent;
pub use session::ConnectionState;
