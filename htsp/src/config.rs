//! ## CONFIGURATION
//!
//! Recognized client options, matching the source's configuration surface
//! field for field. Deserializable with `serde` so a caller can load it from
//! a TOML file with [`ClientConfig::from_toml_str`]; the core itself never
//! reads configuration off disk on its own.

use serde::Deserialize;

use crate::error::HtspError;

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectBackoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self { initial_ms: 1000, max_ms: 30_000, jitter: 0.2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default)]
    pub reconnect_backoff: ReconnectBackoff,
    #[serde(default = "default_htsp_version")]
    pub htsp_version: i64,
}

fn default_port() -> u16 {
    9982
}
fn default_client_name() -> String {
    "htsp-rs".to_string()
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_reply_timeout_ms() -> u64 {
    5000
}
fn default_htsp_version() -> i64 {
    26
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            reconnect_backoff: ReconnectBackoff::default(),
            htsp_version: default_htsp_version(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, HtspError> {
        toml::from_str(s).map_err(|e| HtspError::Malformed(format!("invalid config: {e}")))
    }

    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, HtspError> {
        let contents = std::fs::read_to_string(path).map_err(HtspError::Io)?;
        Self::from_toml_str(&contents)
    }
}
