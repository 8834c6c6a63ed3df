//! Client-facing upgrade: request validation, origin policy, the 101
//! response, and turning the upgraded HTTP connection into a WebSocket.
//!
//! # Design Decisions
//! - Validation happens before any backend is dialed, so a bad client never
//!   costs a backend connection
//! - Origin policy defaults to same-host; browsers always send Origin and
//!   non-browser clients usually do not

use std::fmt;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, Response, StatusCode},
};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::{
    handshake::derive_accept_key,
    protocol::{Role, WebSocketConfig},
};
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::config::{OriginCheck, UpgraderConfig};
use crate::proxy::error::ProxyError;

/// The client side of an upgraded session.
pub type ClientStream = WebSocketStream<TokioIo<Upgraded>>;

/// Decides whether a request's Origin may open a session.
#[derive(Clone, Default)]
pub enum OriginPolicy {
    /// No Origin, or an Origin whose host equals the Host header.
    #[default]
    SameHost,
    /// Any Origin.
    Any,
    /// Exact (case-insensitive) match against a list of origins.
    AllowList(Vec<String>),
    /// Caller-supplied check.
    Custom(Arc<dyn Fn(&Parts) -> bool + Send + Sync>),
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginPolicy::SameHost => f.write_str("SameHost"),
            OriginPolicy::Any => f.write_str("Any"),
            OriginPolicy::AllowList(list) => f.debug_tuple("AllowList").field(list).finish(),
            OriginPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl OriginPolicy {
    fn permits(&self, request: &Parts) -> bool {
        let origin = request
            .headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());

        match self {
            OriginPolicy::Any => true,
            OriginPolicy::Custom(check) => check(request),
            OriginPolicy::AllowList(allowed) => origin.is_some_and(|origin| {
                allowed
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(origin))
            }),
            OriginPolicy::SameHost => {
                let Some(origin) = origin else {
                    return true;
                };
                let host = request
                    .headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                origin_authority(origin).is_some_and(|authority| authority.eq_ignore_ascii_case(host))
            }
        }
    }
}

/// `host[:port]` of an Origin value, port only when it was explicit.
fn origin_authority(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Proof that a request is a valid WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    accept_key: String,
}

impl ClientHandshake {
    /// Value for the Sec-WebSocket-Accept response header.
    pub fn accept_key(&self) -> &str {
        &self.accept_key
    }
}

/// Client-side upgrade settings.
#[derive(Debug, Clone)]
pub struct Upgrader {
    config: WebSocketConfig,
    subprotocols: Vec<String>,
    origin: OriginPolicy,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::from_config(&UpgraderConfig::default())
    }
}

impl Upgrader {
    pub fn from_config(config: &UpgraderConfig) -> Self {
        let origin = match config.origin {
            OriginCheck::SameHost => OriginPolicy::SameHost,
            OriginCheck::Any => OriginPolicy::Any,
            OriginCheck::AllowList => OriginPolicy::AllowList(config.allowed_origins.clone()),
        };
        Self {
            config: websocket_config(config),
            subprotocols: config.subprotocols.clone(),
            origin,
        }
    }

    pub fn with_origin_policy(mut self, origin: OriginPolicy) -> Self {
        self.origin = origin;
        self
    }

    /// Subprotocols chosen locally when the backend picks none, most preferred first.
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        self.config
    }

    /// Check that `request` is an upgrade this proxy will accept.
    pub fn validate(&self, request: &Parts) -> Result<ClientHandshake, ProxyError> {
        let headers = &request.headers;

        if !header_has_token(headers, header::CONNECTION, "upgrade") {
            return Err(ProxyError::InvalidUpgrade("missing `Connection: upgrade`"));
        }
        if !header_has_token(headers, header::UPGRADE, "websocket") {
            return Err(ProxyError::InvalidUpgrade("missing `Upgrade: websocket`"));
        }
        if request.method != Method::GET {
            return Err(ProxyError::InvalidUpgrade("method is not GET"));
        }
        if headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|version| version.as_bytes())
            != Some(b"13".as_slice())
        {
            return Err(ProxyError::UnsupportedVersion);
        }
        if !self.origin.permits(request) {
            let origin = headers
                .get(header::ORIGIN)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            return Err(ProxyError::OriginRejected(origin.to_string()));
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .map(HeaderValue::as_bytes)
            .filter(|key| !key.is_empty())
            .ok_or(ProxyError::InvalidUpgrade("missing `Sec-WebSocket-Key`"))?;

        Ok(ClientHandshake {
            accept_key: derive_accept_key(key),
        })
    }

    /// The 101 response completing the client handshake. `extra` carries the
    /// headers echoed from the backend.
    pub fn switching_protocols(&self, handshake: &ClientHandshake, extra: HeaderMap) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        let headers = response.headers_mut();
        headers.extend(extra);
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        if let Ok(accept) = HeaderValue::from_str(handshake.accept_key()) {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        }
        response
    }

    /// Wait for the HTTP layer to hand over the connection and wrap it.
    pub async fn upgrade(&self, on_upgrade: OnUpgrade) -> Result<ClientStream, hyper::Error> {
        let upgraded = on_upgrade.await?;
        let io = TokioIo::new(upgraded);
        Ok(WebSocketStream::from_raw_socket(io, Role::Server, Some(self.config)).await)
    }
}

/// Frame and buffer limits shared by both sides of a session.
pub fn websocket_config(config: &UpgraderConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .max_message_size(config.max_message_size)
        .max_frame_size(config.max_frame_size)
}

pub(crate) fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn request() -> axum::http::request::Builder {
        Request::builder()
            .uri("/proxy")
            .header(header::HOST, "127.0.0.1:7777")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn accepts_well_formed_upgrade() {
        let handshake = Upgrader::default().validate(&parts(request())).unwrap();
        // RFC 6455 section 1.3 sample.
        assert_eq!(handshake.accept_key(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let plain = parts(Request::builder().uri("/proxy").header(header::HOST, "x"));
        assert!(matches!(
            Upgrader::default().validate(&plain),
            Err(ProxyError::InvalidUpgrade(_))
        ));
    }

    #[test]
    fn post_is_refused() {
        let post = parts(request().method(Method::POST));
        assert!(matches!(
            Upgrader::default().validate(&post),
            Err(ProxyError::InvalidUpgrade("method is not GET"))
        ));
    }

    #[test]
    fn old_version_is_refused() {
        let mut old = parts(request());
        old.headers
            .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert!(matches!(
            Upgrader::default().validate(&old),
            Err(ProxyError::UnsupportedVersion)
        ));
    }

    #[test]
    fn same_host_origin_policy() {
        let upgrader = Upgrader::default();

        let same = parts(request().header(header::ORIGIN, "http://127.0.0.1:7777"));
        assert!(upgrader.validate(&same).is_ok());

        let foreign = parts(request().header(header::ORIGIN, "https://evil.example"));
        assert!(matches!(
            upgrader.validate(&foreign),
            Err(ProxyError::OriginRejected(origin)) if origin == "https://evil.example"
        ));
    }

    #[test]
    fn allow_list_and_custom_policies() {
        let listed = Upgrader::default()
            .with_origin_policy(OriginPolicy::AllowList(vec!["https://app.example".into()]));
        let request_from = |origin| parts(request().header(header::ORIGIN, origin));
        assert!(listed.validate(&request_from("https://APP.example")).is_ok());
        assert!(listed.validate(&request_from("https://other.example")).is_err());

        let custom = Upgrader::default().with_origin_policy(OriginPolicy::Custom(Arc::new(
            |request: &Parts| request.uri.path() == "/proxy",
        )));
        assert!(custom.validate(&request_from("https://anything")).is_ok());
    }

    #[test]
    fn switching_protocols_carries_backend_headers() {
        let upgrader = Upgrader::default();
        let handshake = upgrader.validate(&parts(request())).unwrap();
        let mut extra = HeaderMap::new();
        extra.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));

        let response = upgrader.switching_protocols(&handshake, extra);

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "chat");
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
