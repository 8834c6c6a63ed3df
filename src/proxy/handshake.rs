//! Handshake adapter.
//!
//! # Responsibilities
//! - Build the header set sent to the backend from the client's request
//! - Build the header set returned to the client from the backend's response
//!
//! # Design Decisions
//! - Only identity and negotiation headers cross the proxy; the connector
//!   regenerates Connection, Upgrade, Sec-WebSocket-Key/Version itself
//! - Host is the value the client sent, not the backend authority
//! - Subprotocol offers travel unmodified as one comma-separated header so
//!   the backend negotiates on its own; the proxy's list only applies when
//!   the backend picks none
//! - No I/O

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue};

/// Hook that may rewrite the backend-bound headers after the defaults.
pub type Director = Arc<dyn Fn(&Parts, &mut HeaderMap) + Send + Sync>;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Every subprotocol the client offered, in order.
pub fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_string)
        .collect()
}

/// Headers for the backend handshake.
pub fn backend_request_headers(request: &Parts, peer: Option<SocketAddr>, secure: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let offers = offered_subprotocols(&request.headers);
    if !offers.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&offers.join(", ")) {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    let host = request.headers.get(header::HOST).cloned().or_else(|| {
        request
            .uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    });
    if let Some(host) = host {
        headers.insert(header::HOST, host);
    }

    if let Some(origin) = request.headers.get(header::ORIGIN) {
        headers.insert(header::ORIGIN, origin.clone());
    }
    for cookie in request.headers.get_all(header::COOKIE) {
        headers.append(header::COOKIE, cookie.clone());
    }
    if let Some(request_id) = request.headers.get(&X_REQUEST_ID) {
        headers.insert(X_REQUEST_ID, request_id.clone());
    }

    if let Some(forwarded_for) = forwarded_for(&request.headers, peer) {
        headers.insert(X_FORWARDED_FOR, forwarded_for);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if secure { "https" } else { "http" }),
    );

    headers
}

/// Append the peer address to any existing X-Forwarded-For chain.
fn forwarded_for(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<HeaderValue> {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let chain = match (prior.is_empty(), peer) {
        (true, None) => return None,
        (true, Some(peer)) => peer.ip().to_string(),
        (false, None) => prior.join(", "),
        (false, Some(peer)) => format!("{}, {}", prior.join(", "), peer.ip()),
    };
    HeaderValue::from_str(&chain).ok()
}

/// Headers echoed to the client in the 101 response: the backend's chosen
/// subprotocol and any cookies it set.
///
/// When the backend picks no subprotocol, the first entry of `local` that the
/// client offered is chosen instead.
pub fn client_response_headers(backend: &HeaderMap, offers: &[String], local: &[String]) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let protocol = backend.get(header::SEC_WEBSOCKET_PROTOCOL).cloned().or_else(|| {
        local
            .iter()
            .find(|candidate| offers.contains(candidate))
            .and_then(|chosen| HeaderValue::from_str(chosen).ok())
    });
    if let Some(protocol) = protocol {
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    for cookie in backend.get_all(header::SET_COOKIE) {
        headers.append(header::SET_COOKIE, cookie.clone());
    }

    headers
}
