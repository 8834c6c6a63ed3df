//! Proxy error taxonomy and its mapping to HTTP responses.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderValue, Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::proxy::relay::Peer;

/// Backend response that refused the upgrade.
pub type RejectedResponse = Response<Bytes>;

/// Why the backend handshake did not produce a WebSocket.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("invalid backend address: {0}")]
    Address(String),

    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("cannot build handshake request: {0}")]
    Request(#[from] axum::http::Error),

    /// The backend answered with something other than 101.
    #[error("upgrade refused with {}", .0.status())]
    Rejected(RejectedResponse),

    /// A 101 that does not complete a valid WebSocket handshake.
    #[error("invalid handshake response: {0}")]
    Protocol(&'static str),
}

/// Errors raised while setting up or relaying a session.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request is not a well-formed WebSocket upgrade.
    #[error("invalid upgrade request: {0}")]
    InvalidUpgrade(&'static str),

    /// The client asked for a protocol version other than 13.
    #[error("unsupported WebSocket version")]
    UnsupportedVersion,

    /// The Origin header failed the upgrader's origin policy.
    #[error("origin `{0}` not allowed")]
    OriginRejected(String),

    /// The HTTP connection carries no upgrade handle.
    #[error("connection cannot be upgraded")]
    NotUpgradable,

    /// The resolver could not map the request to a backend.
    #[error("cannot resolve backend: {0}")]
    Resolve(String),

    /// Every session slot is taken.
    #[error("session limit reached")]
    CapacityExhausted,

    /// Dial or handshake against the backend failed.
    #[error("backend {endpoint} unavailable: {source}")]
    BackendUnavailable {
        endpoint: String,
        #[source]
        source: BackendError,
    },

    /// The backend did not finish its handshake in time.
    #[error("backend {endpoint} did not answer within {timeout_ms}ms")]
    BackendTimeout { endpoint: String, timeout_ms: u128 },

    /// Reading from one side of a live session failed.
    #[error("read from {peer} failed: {source}")]
    RelayRead {
        peer: Peer,
        #[source]
        source: tungstenite::Error,
    },

    /// Writing to one side of a live session failed.
    #[error("write to {peer} failed: {source}")]
    RelayWrite {
        peer: Peer,
        #[source]
        source: tungstenite::Error,
    },
}

impl ProxyError {
    /// Status returned to a client whose handshake is refused.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUpgrade(_) | ProxyError::NotUpgradable => StatusCode::BAD_REQUEST,
            ProxyError::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
            ProxyError::OriginRejected(_) => StatusCode::FORBIDDEN,
            ProxyError::Resolve(_) => StatusCode::BAD_GATEWAY,
            ProxyError::CapacityExhausted | ProxyError::BackendUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RelayRead { .. } | ProxyError::RelayWrite { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Label used for the upgrade metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidUpgrade(_) | ProxyError::NotUpgradable => "invalid_upgrade",
            ProxyError::UnsupportedVersion => "unsupported_version",
            ProxyError::OriginRejected(_) => "origin_rejected",
            ProxyError::Resolve(_) => "resolve_failed",
            ProxyError::CapacityExhausted => "capacity_exhausted",
            ProxyError::BackendUnavailable { .. } => "backend_unavailable",
            ProxyError::BackendTimeout { .. } => "backend_timeout",
            ProxyError::RelayRead { .. } => "relay_read",
            ProxyError::RelayWrite { .. } => "relay_write",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ProxyError::BackendUnavailable {
                source: BackendError::Rejected(rejected),
                ..
            } => relay_rejection(&rejected),
            ProxyError::UnsupportedVersion => {
                let mut response = (StatusCode::UPGRADE_REQUIRED, "Upgrade Required").into_response();
                response.headers_mut().insert(
                    header::SEC_WEBSOCKET_VERSION,
                    HeaderValue::from_static("13"),
                );
                response
            }
            other => {
                let status = other.status();
                let reason = status.canonical_reason().unwrap_or("Proxy Error");
                (status, reason).into_response()
            }
        }
    }
}

/// Hand the backend's refusal to the client as-is, minus hop-by-hop headers.
fn relay_rejection(rejected: &RejectedResponse) -> axum::response::Response {
    let mut headers = rejected.headers().clone();
    for name in [
        header::CONNECTION,
        header::UPGRADE,
        header::TRANSFER_ENCODING,
        header::CONTENT_LENGTH,
        header::SEC_WEBSOCKET_ACCEPT,
    ] {
        headers.remove(name);
    }
    let mut response = Response::new(Body::from(rejected.body().clone()));
    *response.status_mut() = rejected.status();
    *response.headers_mut() = headers;
    response
}
