//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `CLAWTABS_URL` + `CLAWTABS_TOKEN` (seed a
//!    gateway with id `default`), `CLAWTABS_STORE`
//! 2. **Config file**: path via `--config <path>`, `CLAWTABS_CONFIG`, or
//!    `clawtabs.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [client]
//! version = "0.2.0"
//! locale = "en-US"
//! user_agent = "ClawTabs/0.2.0"
//! reconnect_delay_ms = 3000
//! handshake_timeout_ms = 10000
//! # request_timeout_ms = 30000   # unset = wait for the response or a disconnect
//! test_timeout_ms = 10000
//!
//! [store]
//! path = "~/.config/clawtabs/gateways.json"
//!
//! [logging]
//! level = "info"
//!
//! [[gateways]]
//! id = "home"
//! name = "Home"
//! url = "ws://localhost:18789"
//! token = "secret"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::gateway::GatewayOptions;
use crate::protocol::ClientIdentity;
use crate::store::GatewayConfig;
use crate::util::{expand_tilde, is_ws_url};

/// Id of the gateway seeded from `CLAWTABS_URL` / `CLAWTABS_TOKEN`.
pub const ENV_GATEWAY_ID: &str = "default";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Gateways registered on startup if the store does not know them yet.
    #[serde(default)]
    pub gateways: Vec<GatewaySeed>,
}

/// Identity and timing of gateway sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Client version sent in the `connect` handshake (default `0.2.0`).
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Fixed delay between reconnect attempts (default 3000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Deadline for the `connect` request after the challenge (default 10 000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Per-request deadline. Unset by default.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Deadline for `clawtabs test` and CLI waits (default 10 000).
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON store location; `~` is expanded. Override with `CLAWTABS_STORE`.
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A `[[gateways]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewaySeed {
    pub id: String,
    /// Display name (defaults to the id).
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    pub token: String,
}

impl GatewaySeed {
    pub fn to_config(&self) -> GatewayConfig {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        GatewayConfig::new(&self.id, name, &self.url, &self.token)
    }
}

fn default_version() -> String {
    "0.2.0".to_string()
}
fn default_locale() -> String {
    "en-US".to_string()
}
fn default_user_agent() -> String {
    "ClawTabs/0.2.0".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_test_timeout_ms() -> u64 {
    10_000
}
fn default_store_path() -> String {
    "~/.config/clawtabs/gateways.json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            locale: default_locale(),
            user_agent: default_user_agent(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: None,
            test_timeout_ms: default_test_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// An explicit `path` (or `CLAWTABS_CONFIG`) must exist. Otherwise
    /// `clawtabs.toml` in the current directory is used if present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(ToString::to_string)
            .or_else(|| std::env::var("CLAWTABS_CONFIG").ok());

        let mut config = match explicit {
            Some(p) => Self::from_file(Path::new(&p))?,
            None if Path::new("clawtabs.toml").exists() => {
                Self::from_file(Path::new("clawtabs.toml"))?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply environment overrides, reading variables through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(store) = lookup("CLAWTABS_STORE") {
            self.store.path = store;
        }

        match (lookup("CLAWTABS_URL"), lookup("CLAWTABS_TOKEN")) {
            (Some(url), Some(token)) => {
                let seed = GatewaySeed {
                    id: ENV_GATEWAY_ID.to_string(),
                    name: Some("Default".to_string()),
                    url,
                    token,
                };
                match self.gateways.iter_mut().find(|g| g.id == ENV_GATEWAY_ID) {
                    Some(existing) => *existing = seed,
                    None => self.gateways.push(seed),
                }
            }
            (Some(_), None) => {
                return Err(ConfigError::Invalid(
                    "CLAWTABS_URL is set but CLAWTABS_TOKEN is not".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "CLAWTABS_TOKEN is set but CLAWTABS_URL is not".into(),
                ))
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, seed) in self.gateways.iter().enumerate() {
            if seed.id.is_empty() {
                return Err(ConfigError::Invalid(format!("gateways[{i}]: id is empty")));
            }
            if seed.url.is_empty() {
                return Err(ConfigError::Invalid(format!("gateway {}: url is empty", seed.id)));
            }
            if seed.token.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "gateway {}: token is empty",
                    seed.id
                )));
            }
            if !is_ws_url(&seed.url) {
                return Err(ConfigError::Invalid(format!(
                    "gateway {}: url must start with ws:// or wss:// (got {})",
                    seed.id, seed.url
                )));
            }
            if self.gateways[..i].iter().any(|g| g.id == seed.id) {
                return Err(ConfigError::Invalid(format!(
                    "gateway {}: duplicate id",
                    seed.id
                )));
            }
        }
        if self.client.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "client.reconnect_delay_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Session options derived from `[client]`.
    pub fn gateway_options(&self) -> GatewayOptions {
        let c = &self.client;
        GatewayOptions {
            identity: ClientIdentity {
                version: c.version.clone(),
                locale: c.locale.clone(),
                user_agent: c.user_agent.clone(),
            },
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms),
            handshake_timeout: Some(Duration::from_millis(c.handshake_timeout_ms)),
            request_timeout: c.request_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.store.path).into_owned())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.client.test_timeout_ms)
    }
}
