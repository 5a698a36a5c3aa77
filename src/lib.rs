#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! clawtabs library — WebSocket client for one or more OpenClaw gateways.
//!
//! ## Architecture
//!
//! ```text
//! protocol.rs      — req/res/event frames, connect handshake params, attachments
//! gateway.rs       — one socket per gateway: challenge handshake, request
//!                    multiplexing, fixed-interval reconnect
//! manager.rs       — registry of gateways, routing by id, merged event stream
//! store/
//!   mod.rs         — ConfigStore trait + persisted records
//!   memory.rs      — in-memory store
//!   file.rs        — JSON document store with atomic writes
//! config.rs        — TOML + env-var configuration for the CLI
//! error.rs         — error taxonomy (transport, protocol, routing, storage)
//! util.rs          — small helpers
//! ```
//!
//! ## Data flow
//!
//! Outbound: caller → [`GatewayManager`] (by gateway id, or first connected) →
//! [`Gateway::request`] → JSON text frame → socket.
//!
//! Inbound: socket → [`protocol::decode`] → [`Gateway`] (resolves the pending
//! request or emits a [`GatewayEvent`]) → manager forwarder (tags with the
//! gateway id) → [`ManagerEvent`] broadcast.

pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod protocol;
pub mod store;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{GatewayError, ManagerError, StoreError};
pub use gateway::{ConnectionStatus, Gateway, GatewayEvent, GatewayOptions};
pub use manager::{GatewayManager, GatewayUpdate, ManagerEvent, TaggedSession};
pub use protocol::{Attachment, ClientIdentity};
pub use store::{ConfigStore, FileStore, GatewayConfig, GatewayStatus, MemoryStore};
