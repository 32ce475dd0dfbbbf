use std::time::Duration;

use serde::Deserialize;
use wavelink_core::error::{Result, WavelinkError};

use crate::transport::TransportKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// URL prefix the engine is mounted under.
    #[serde(default = "default_path")]
    pub path: String,

    /// Listen address used by the binary.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Time between server-initiated pings.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Time to wait for a pong before declaring the session dead.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Max time for a transport upgrade to complete.
    #[serde(default = "default_upgrade_timeout_ms")]
    pub upgrade_timeout_ms: u64,

    /// Max decoded body size for a polling POST.
    #[serde(default = "default_max_http_buffer_size")]
    pub max_http_buffer_size: usize,

    /// Enabled transports, by wire name.
    #[serde(default = "default_transports")]
    pub transports: Vec<String>,

    /// Gate for transport upgrades.
    #[serde(default = "default_true")]
    pub allow_upgrades: bool,

    /// WebSocket compression knobs. The extension itself is negotiated by
    /// the WebSocket layer; the threshold is advisory.
    #[serde(default)]
    pub per_message_deflate: CompressionConfig,

    /// Polling response compression.
    #[serde(default)]
    pub http_compression: CompressionConfig,

    /// Sticky-routing cookie, off by default.
    #[serde(default)]
    pub cookie: CookieConfig,

    /// Extra message appended right after the open packet.
    #[serde(default)]
    pub initial_packet: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            listen: default_listen(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            upgrade_timeout_ms: default_upgrade_timeout_ms(),
            max_http_buffer_size: default_max_http_buffer_size(),
            transports: default_transports(),
            allow_upgrades: true,
            per_message_deflate: CompressionConfig::default(),
            http_compression: CompressionConfig::default(),
            cookie: CookieConfig::default(),
            initial_packet: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(WavelinkError::Internal(
                "path must start with '/'".into(),
            ));
        }
        if self.transports.is_empty() {
            return Err(WavelinkError::Internal(
                "transports must not be empty".into(),
            ));
        }
        for name in &self.transports {
            if TransportKind::parse(name).is_none() {
                return Err(WavelinkError::Internal(format!(
                    "unknown transport in config: {name}"
                )));
            }
        }
        if self.ping_interval_ms == 0 || self.ping_timeout_ms == 0 {
            return Err(WavelinkError::Internal(
                "ping_interval_ms and ping_timeout_ms must be positive".into(),
            ));
        }
        if self.upgrade_timeout_ms == 0 {
            return Err(WavelinkError::Internal(
                "upgrade_timeout_ms must be positive".into(),
            ));
        }
        if self.max_http_buffer_size == 0 {
            return Err(WavelinkError::Internal(
                "max_http_buffer_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    /// True if the given transport is enabled.
    pub fn transport_enabled(&self, kind: TransportKind) -> bool {
        self.transports.iter().any(|t| t == kind.as_str())
    }

    /// Upgrade targets reachable from the given transport, for the
    /// handshake `upgrades` list.
    pub fn upgrades_from(&self, kind: TransportKind) -> Vec<String> {
        if !self.allow_upgrades || kind != TransportKind::Polling {
            return Vec::new();
        }
        if self.transport_enabled(TransportKind::WebSocket) {
            vec![TransportKind::WebSocket.as_str().to_owned()]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum body size, in bytes, before compression kicks in.
    #[serde(default = "default_compression_threshold")]
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_compression_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cookie_name")]
    pub name: String,

    #[serde(default = "default_cookie_path")]
    pub path: String,

    #[serde(default = "default_true")]
    pub http_only: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_cookie_name(),
            path: default_cookie_path(),
            http_only: true,
        }
    }
}

impl CookieConfig {
    /// `Set-Cookie` header value for a fresh session.
    pub fn header_value(&self, sid: &str) -> String {
        let mut v = format!("{}={}; Path={}; SameSite=Lax", self.name, sid, self.path);
        if self.http_only {
            v.push_str("; HttpOnly");
        }
        v
    }
}

fn default_path() -> String {
    "/engine.io/".into()
}
fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_ping_interval_ms() -> u64 {
    25000
}
fn default_ping_timeout_ms() -> u64 {
    5000
}
fn default_upgrade_timeout_ms() -> u64 {
    10000
}
fn default_max_http_buffer_size() -> usize {
    1_000_000
}
fn default_transports() -> Vec<String> {
    vec!["polling".into(), "websocket".into()]
}
fn default_true() -> bool {
    true
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_cookie_name() -> String {
    "io".into()
}
fn default_cookie_path() -> String {
    "/".into()
}
