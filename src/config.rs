//! Gateway configuration.
//!
//! [`GatewayConfig`] is populated by the embedding host, either directly or
//! by deserializing a YAML document (see the `docgate` binary). It is
//! read-only once the gateway has started.

use serde::{Deserialize, Serialize};

/// Maximum length of a collection name, in bytes.
pub const COLLECTION_NAME_MAX: usize = 128;

/// Maximum length of a WebSocket correlation key, in bytes.
pub const WS_KEY_MAX: usize = 36;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 9191;

/// Default cap on request and WebSocket message bodies (64 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Runtime configuration for the gateway.
///
/// All fields have serde defaults, so a partial YAML document (or
/// `GatewayConfig::default()`) yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    /// When `false`, [`crate::Gateway::new`] returns no handle and nothing
    /// is started.
    pub enabled: bool,

    /// Address to bind the listener to.
    pub bind: String,

    /// TCP port. Port `0` asks the OS for a free port; the bound port is
    /// reported by `Gateway::local_addr`.
    pub port: u16,

    /// Shared access token. When set, requests must present it in the
    /// `X-Access-Token` header.
    pub access_token: Option<String>,

    /// Admit token-less read-only requests (GET, HEAD, root query) even
    /// when an access token is configured.
    pub read_anon: bool,

    /// Maximum size of a request body or WebSocket message, in bytes.
    pub max_body_size: usize,

    /// Run the event loop on the thread that calls `start` instead of a
    /// background worker.
    pub blocking: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            access_token: None,
            read_anon: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            blocking: false,
        }
    }
}

impl GatewayConfig {
    /// The `host:port` string the listener binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
