//! Error types for gateway sessions, the manager, and the config store.
//!
//! Transport failures (`Disconnected`) are delivered to every pending request
//! when a socket goes away. Protocol failures (`Rejected`) only affect the one
//! request the server answered with `ok: false`. Routing failures are raised by
//! the manager before anything touches a socket.

use serde_json::Value;
use thiserror::Error;

/// Errors returned by [`crate::Gateway`] operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No open socket; the request was not sent.
    #[error("not connected")]
    NotConnected,
    /// The socket closed (or was closed) while the request was pending.
    #[error("disconnected")]
    Disconnected,
    /// The server answered with `ok: false`; carries the server's error payload.
    #[error("request rejected by gateway: {0}")]
    Rejected(Value),
    /// No response within the configured deadline.
    #[error("timed out waiting for gateway")]
    Timeout,
    /// The socket could not be opened, or closed before the handshake finished.
    #[error("connection failed")]
    ConnectionFailed,
    /// Outbound frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl GatewayError {
    /// Human-readable message for the server-supplied error payload, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Rejected(v) => v["message"].as_str().or_else(|| v.as_str()),
            _ => None,
        }
    }
}

/// Errors returned by [`crate::GatewayManager`] routing and lifecycle calls.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No gateway with this id is registered.
    #[error("gateway {0} not found")]
    UnknownGateway(String),
    /// The gateway exists but has no live, connected session.
    #[error("gateway {0} not connected")]
    NotConnected(String),
    /// No gateway id given and none is connected.
    #[error("no connected gateway available")]
    NoConnectedGateway,
    #[error("gateway {id} has invalid url {url:?} (expected ws:// or wss://)")]
    InvalidUrl { id: String, url: String },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a [`crate::ConfigStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading [`crate::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
