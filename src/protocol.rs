//! Gateway wire protocol: JSON text frames over a single WebSocket.
//!
//! ## Frames
//!
//! | Direction        | Shape                                                        |
//! |------------------|--------------------------------------------------------------|
//! | client → gateway | `{"type":"req","id":"<n>","method":"<name>","params":{...}}` |
//! | gateway → client | `{"type":"res","id":"<n>","ok":true,"payload":{...}}`        |
//! | gateway → client | `{"type":"res","id":"<n>","ok":false,"error":{...}}`         |
//! | gateway → client | `{"type":"event","event":"<name>","payload":{...}}`          |
//!
//! Responses are correlated to requests by `id` only. Events are unsolicited.
//!
//! ## Handshake
//!
//! 1. Open the socket and send nothing.
//! 2. Wait for the `connect.challenge` event.
//! 3. Send a `connect` request carrying [`ConnectParams`] (including the token).
//! 4. The session counts as connected only once that request resolves `ok`.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Protocol version sent as both `minProtocol` and `maxProtocol`.
pub const PROTOCOL_VERSION: u32 = 3;

/// Client id announced in the `connect` request.
pub const CLIENT_ID: &str = "webchat";

/// Request method names.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const CHAT_HISTORY: &str = "chat.history";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_ABORT: &str = "chat.abort";
    pub const SESSIONS_DELETE: &str = "sessions.delete";
    pub const SESSION_UPDATE: &str = "session.update";
}

/// Inbound event names.
pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const CHAT: &str = "chat";
    pub const AGENT: &str = "agent";

    /// Events forwarded to the application unchanged.
    pub fn is_chat_event(name: &str) -> bool {
        name == CHAT || name == AGENT
    }
}

/// Top-level frame envelope, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    /// Build a request frame.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }
}

/// Serialize a frame to its JSON text form.
pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Parse an inbound text frame. Anything that is not a well-formed frame is
/// logged and dropped.
pub fn decode(text: &str) -> Option<Frame> {
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!(error = %e, len = text.len(), "Discarding malformed gateway frame");
            None
        }
    }
}

/// Client identity fields that vary between builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub version: String,
    pub locale: String,
    pub user_agent: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            version: "0.2.0".to_string(),
            locale: "en-US".to_string(),
            user_agent: "ClawTabs/0.2.0".to_string(),
        }
    }
}

/// `connect` request params. Field names and constants must match the gateway
/// server exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: Map<String, Value>,
    pub auth: AuthParams,
    pub locale: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthParams {
    pub token: String,
}

impl ConnectParams {
    pub fn new(identity: &ClientIdentity, token: &str) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: CLIENT_ID.to_string(),
                version: identity.version.clone(),
                platform: "web".to_string(),
                mode: "webchat".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            caps: Vec::new(),
            commands: Vec::new(),
            permissions: Map::new(),
            auth: AuthParams {
                token: token.to_string(),
            },
            locale: identity.locale.clone(),
            user_agent: identity.user_agent.clone(),
        }
    }
}

/// A chat attachment as supplied by the caller: either raw base64 or a
/// `data:<mime>;base64,<data>` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Attachment as sent in `chat.send`; `content` is always bare base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    pub content: String,
    pub mime_type: String,
}

impl Attachment {
    /// Wrap a data URL (or bare base64 string). The MIME type is taken from the
    /// URL when sent, unless one is set explicitly.
    pub fn from_data_url(data_url: impl Into<String>) -> Self {
        Self {
            content: data_url.into(),
            mime_type: None,
        }
    }

    /// Base64-encode raw bytes.
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            content: BASE64_STANDARD.encode(bytes),
            mime_type: Some(mime_type.into()),
        }
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Strip any `data:<mime>;base64,` prefix so the wire payload is raw base64.
    pub fn to_wire(&self) -> WireAttachment {
        let explicit = self.mime_type.as_deref().filter(|m| !m.is_empty());
        match split_data_url(&self.content) {
            Some((mime, data)) => WireAttachment {
                content: data.to_string(),
                mime_type: explicit.unwrap_or(mime).to_string(),
            },
            None => WireAttachment {
                content: self.content.clone(),
                mime_type: explicit.unwrap_or_default().to_string(),
            },
        }
    }
}

/// Split `data:<mime>;base64,<data>` into `(mime, data)`.
fn split_data_url(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() || mime.contains(';') {
        return None;
    }
    Some((mime, data))
}

static IDEMPOTENCY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh idempotency key for `chat.send`: `ct-<ms>-<seq>-<random>`.
///
/// The sequence number keeps keys distinct within a process even when two
/// calls land in the same millisecond.
pub fn idempotency_key() -> String {
    let seq = IDEMPOTENCY_SEQ.fetch_add(1, Ordering::Relaxed);
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("ct-{}-{seq}-{}", crate::util::now_ms(), &random[..6])
}
