//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the WebSocket proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration (bind address, route, TLS).
    pub listener: ListenerConfig,

    /// Backend the proxy forwards sessions to.
    pub backend: BackendConfig,

    /// Relay behaviour shared by every session.
    pub proxy: ProxyConfiguration,

    /// Client-facing handshake settings.
    pub upgrader: UpgraderConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Path the proxy is mounted on. `/` proxies every path.
    pub path: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent sessions (backpressure).
    pub max_sessions: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            path: "/".to_string(),
            tls: None,
            max_sessions: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Backend target.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base WebSocket URL (e.g., "ws://127.0.0.1:9000"). The request path is
    /// appended to its path.
    pub url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
        }
    }
}

/// Options recognised by the relay. Immutable once a proxy is built.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfiguration {
    /// Answer client pings in the proxy instead of forwarding them.
    pub support_client_ping_pong: bool,

    /// Deadline for dialing and upgrading the backend, in milliseconds.
    pub connect_timeout_ms: u64,

    /// How long a direction may take to close once teardown starts, in
    /// milliseconds.
    pub close_timeout_ms: u64,
}

impl ProxyConfiguration {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            support_client_ping_pong: false,
            connect_timeout_ms: 5_000,
            close_timeout_ms: 1_000,
        }
    }
}

/// Origin check applied to client upgrade requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginCheck {
    /// Origin, when present, must name the same host as the Host header.
    SameHost,
    /// Every origin is accepted.
    Any,
    /// Origin must be listed in `allowed_origins`.
    AllowList,
}

/// Client-facing handshake configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpgraderConfig {
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// Largest message accepted from a client, in bytes.
    pub max_message_size: Option<usize>,

    /// Largest single frame accepted from a client, in bytes.
    pub max_frame_size: Option<usize>,

    /// Subprotocols the proxy picks from the client's offers, in this order of
    /// preference, when the backend's handshake names none. Offers are always
    /// forwarded to the backend unmodified.
    pub subprotocols: Vec<String>,

    /// Origin policy.
    pub origin: OriginCheck,

    /// Origins accepted by the `allow-list` policy.
    pub allowed_origins: Vec<String>,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 128 * 1024,
            write_buffer_size: 128 * 1024,
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            subprotocols: Vec::new(),
            origin: OriginCheck::SameHost,
            allowed_origins: Vec::new(),
        }
    }
}

/// Timeout configuration for the handshake phase.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for answering an upgrade request, in seconds.
    pub handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { handshake_secs: 10 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
