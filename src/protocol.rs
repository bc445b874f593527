//! Gateway wire protocol types and event normalization.
//!
//! Every frame is a single JSON object carried in a WebSocket text message.
//! Three envelope shapes exist, discriminated by `type`:
//!
//! ```text
//! {"type":"req",   "id":"req-…", "method":"connect", "params":{…}}
//! {"type":"res",   "id":"req-…", "ok":true,  "payload":{…}}
//! {"type":"res",   "id":"req-…", "ok":false, "error":"…" | {"message":"…"}}
//! {"type":"event", "event":"connect.challenge" | "chat" | "agent", "payload":{…}}
//! ```
//!
//! ## Handshake
//!
//! The gateway opens with a `connect.challenge` event carrying a nonce; the
//! client answers with a signed `connect` request. Once that is acknowledged,
//! `chat.send` requests start runs whose streamed output arrives as `agent`
//! or `chat` events. The two event dialects carry the same information in
//! different shapes, so both are normalized into [`RunUpdate`] values here
//! and the session loop only ever handles one shape.

// Rust guideline compliant 2026-02

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Identity and handshake constants ──────────────────────────────────────

/// Version tag leading the canonical auth payload.
pub const AUTH_VERSION: &str = "v2";
/// Client identifier presented during `connect`.
pub const CLIENT_ID: &str = "gateway-client";
/// Client mode: a headless backend consumer, not an interactive UI.
pub const CLIENT_MODE: &str = "backend";
/// Role requested for this connection.
pub const ROLE: &str = "operator";
/// Scopes requested for this connection.
pub const SCOPES: [&str; 2] = ["operator.read", "operator.write"];
/// Lowest gateway protocol revision this client speaks.
pub const PROTOCOL_MIN: u32 = 3;
/// Highest gateway protocol revision this client speaks.
pub const PROTOCOL_MAX: u32 = 3;
/// Locale advertised during `connect`.
pub const LOCALE: &str = "en-US";
/// Session key shared by all `chat.send` requests.
pub const SESSION_KEY: &str = "main";

/// Method name of the handshake request.
pub const METHOD_CONNECT: &str = "connect";
/// Method name of the chat request.
pub const METHOD_CHAT_SEND: &str = "chat.send";

/// Event name of the handshake challenge.
pub const EVENT_CHALLENGE: &str = "connect.challenge";
/// Event name of the chat dialect stream.
pub const EVENT_CHAT: &str = "chat";
/// Event name of the agent dialect stream.
pub const EVENT_AGENT: &str = "agent";

/// User agent string advertised during `connect`.
pub fn user_agent() -> String {
    format!("openclaw-client/{}", env!("CARGO_PKG_VERSION"))
}

// ─── Frame envelope ────────────────────────────────────────────────────────

/// A single wire frame, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client-to-gateway request.
    Req {
        /// Request ID, echoed back in the matching `res` frame.
        id: String,
        /// Method name (`connect` or `chat.send`).
        method: String,
        /// Method parameters.
        params: Value,
    },

    /// Gateway response to an earlier `req`.
    Res {
        /// ID of the request this answers.
        id: String,
        /// Whether the request succeeded.
        ok: bool,
        /// Result payload on success.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        /// Error details on failure: a bare string or `{"message": …}`.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        error: Value,
    },

    /// Unsolicited gateway event.
    Event {
        /// Event name (`connect.challenge`, `chat`, `agent`).
        event: String,
        /// Event payload.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        /// Some gateway builds put agent run fields at the top level of the
        /// frame instead of under `payload`; captured here so normalization
        /// can fall back to them.
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
}

impl Frame {
    /// Build a request frame, serializing `params`.
    pub fn req<T: Serialize>(id: String, method: &str, params: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Req {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

/// Extract a human-readable message from a wire error value, which may be
/// a bare string, an object with a `message` field, or anything else.
pub fn error_message(error: &Value, fallback: &str) -> String {
    let text = match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(
                || serde_json::to_string(error).unwrap_or_default(),
                str::to_string,
            ),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

// ─── Connect parameters ────────────────────────────────────────────────────

/// Parameters of the signed `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Lowest protocol revision the client accepts.
    pub min_protocol: u32,
    /// Highest protocol revision the client accepts.
    pub max_protocol: u32,
    /// Client identification block.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Capability flags (none for a backend client).
    pub caps: Vec<String>,
    /// Commands exposed to the gateway (none for a backend client).
    pub commands: Vec<String>,
    /// Permission grants (empty object for a backend client).
    pub permissions: Map<String, Value>,
    /// Shared token block.
    pub auth: AuthToken,
    /// Locale advertised to the gateway.
    pub locale: String,
    /// User agent string.
    pub user_agent: String,
    /// Device identity proof.
    pub device: DeviceAuth,
}

/// Client identification block inside [`ConnectParams`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Stable client identifier.
    pub id: String,
    /// Client version.
    pub version: String,
    /// Host platform.
    pub platform: String,
    /// Operating mode.
    pub mode: String,
}

/// Shared token block inside [`ConnectParams`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    /// Shared or device token, empty when neither is available.
    pub token: String,
}

/// Device identity proof inside [`ConnectParams`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    /// Device ID: SHA-256 of the raw public key, lowercase hex.
    pub id: String,
    /// Raw Ed25519 public key, base64url without padding.
    pub public_key: String,
    /// Signature over the canonical auth payload, base64url without padding.
    pub signature: String,
    /// Signing timestamp in epoch milliseconds.
    pub signed_at: u64,
    /// Challenge nonce echoed back, empty when none was issued.
    pub nonce: String,
}

/// Parameters of a `chat.send` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    /// Gateway session the message belongs to.
    pub session_key: String,
    /// Message text.
    pub message: String,
    /// Deduplication key for gateway-side retries.
    pub idempotency_key: String,
}

// ─── Response payloads ─────────────────────────────────────────────────────

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengePayload {
    /// Nonce to fold into the signed auth payload.
    pub nonce: Option<String>,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectAck {
    /// Auth block, present when the gateway issues or refreshes a token.
    pub auth: Option<ConnectAckAuth>,
}

/// Auth block inside [`ConnectAck`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAckAuth {
    /// Device token to persist for future handshakes.
    pub device_token: Option<String>,
}

/// Payload of a successful `chat.send` acknowledgment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAck {
    /// Run started for this message, when the gateway names it directly.
    pub run_id: Option<String>,
    /// Fallback identifier used by older gateway builds.
    pub id: Option<String>,
}

impl ChatAck {
    /// The run ID to track, preferring `runId` over the legacy `id` field.
    pub fn resolved_run_id(&self) -> Option<&str> {
        self.run_id.as_deref().or(self.id.as_deref())
    }
}

// ─── Run event normalization ───────────────────────────────────────────────

/// A normalized streaming update for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunUpdate {
    /// Incremental assistant text.
    Delta(String),
    /// The run finished; the accumulated text is the final response.
    End,
    /// The run failed.
    Error(String),
}

/// A gateway event reduced to a run ID and the updates it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    /// Run identifier as sent by the gateway.
    pub run_id: String,
    /// Updates in arrival order. A chat frame can carry a delta and a
    /// completion marker at once.
    pub updates: Vec<RunUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentEventPayload {
    run_id: Option<String>,
    stream: Option<String>,
    data: Option<AgentEventData>,
}

#[derive(Debug, Deserialize)]
struct AgentEventData {
    delta: Option<String>,
    phase: Option<String>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatEventPayload {
    run_id: Option<String>,
    error: Option<Value>,
    message: Option<ChatEventMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatEventMessage {
    role: Option<String>,
    content: Option<ChatEventContent>,
}

#[derive(Debug, Deserialize)]
struct ChatEventContent {
    delta: Option<String>,
    done: Option<bool>,
}

/// Normalize an `agent` event.
///
/// `run_id`, `stream` and `data` normally sit under `payload`; when the
/// payload is absent they are read from the top level of the frame instead.
/// Returns `None` when the event carries nothing actionable.
pub fn normalize_agent_event(payload: &Value, top_level: &Map<String, Value>) -> Option<RunEvent> {
    let fallback;
    let source = if payload.is_object() {
        payload
    } else {
        fallback = Value::Object(top_level.clone());
        &fallback
    };

    let event = AgentEventPayload::deserialize(source).ok()?;
    let run_id = event.run_id?;
    let data = event.data?;

    let mut updates = Vec::new();
    match event.stream.as_deref() {
        Some("assistant") => {
            if let Some(delta) = event_text(data.delta) {
                updates.push(RunUpdate::Delta(delta));
            }
        }
        Some("lifecycle") => match data.phase.as_deref() {
            Some("end") => updates.push(RunUpdate::End),
            Some("error") => {
                let message = data
                    .error
                    .as_ref()
                    .map_or_else(|| "Agent error".to_string(), |e| error_message(e, "Agent error"));
                updates.push(RunUpdate::Error(message));
            }
            _ => {}
        },
        _ => {}
    }

    if updates.is_empty() {
        None
    } else {
        Some(RunEvent { run_id, updates })
    }
}

/// Normalize a `chat` event payload.
///
/// Returns `None` for anything that is not an assistant stream addressed to
/// a named run: other roles, empty frames, or frames without a run ID.
pub fn normalize_chat_event(payload: &Value) -> Option<RunEvent> {
    let event = ChatEventPayload::deserialize(payload).ok()?;
    let run_id = event.run_id?;

    if let Some(error) = event.error.as_ref().filter(|e| !is_blank(e)) {
        return Some(RunEvent {
            run_id,
            updates: vec![RunUpdate::Error(error_message(error, "Run failed"))],
        });
    }

    let message = event.message?;
    if message.role.as_deref() != Some("assistant") {
        return None;
    }
    let content = message.content?;

    let mut updates = Vec::new();
    if let Some(delta) = event_text(content.delta) {
        updates.push(RunUpdate::Delta(delta));
    }
    if content.done.unwrap_or(false) {
        updates.push(RunUpdate::End);
    }

    if updates.is_empty() {
        None
    } else {
        Some(RunEvent { run_id, updates })
    }
}

/// Keep only non-empty text.
fn event_text(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.is_empty())
}

/// An absent, empty or explicitly false error value does not mark a failure.
fn is_blank(error: &Value) -> bool {
    match error {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Bool(b) => !b,
        _ => false,
    }
}

// ─── Request identifiers ───────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Four random bytes as lowercase hex.
fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate a request ID: `req-<epoch ms>-<8 hex chars>`.
pub fn request_id() -> String {
    format!("req-{}-{}", epoch_ms(), random_suffix())
}

/// Generate an idempotency key scoped to a conversation:
/// `<conversation>-<epoch ms>-<8 hex chars>`.
pub fn idempotency_key(conversation_id: &str) -> String {
    format!("{}-{}-{}", conversation_id, epoch_ms(), random_suffix())
}

// ─── Tests ─────────────────────────────────────────────────────────────────
