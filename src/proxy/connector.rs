//! Backend connector: opens the proxy's own WebSocket to the backend.
//!
//! # Responsibilities
//! - Dial the resolved endpoint, over TLS for `wss://`
//! - Run the HTTP/1.1 upgrade with the adapted headers and check the accept key
//! - Bound dial and handshake together by the connect timeout
//! - Report the backend's handshake response headers, or why it failed
//!
//! # Design Decisions
//! - The upgrade runs over a hyper client connection and the upgraded IO is
//!   wrapped with `from_raw_socket`, the same way the client side is
//! - A 101 that names no subprotocol is accepted even when offers were sent
//! - A non-101 answer is kept whole (status, headers, body) for relaying

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, Response, StatusCode},
};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{
    handshake::{client::generate_key, derive_accept_key},
    protocol::{Role, WebSocketConfig},
};
use tokio_tungstenite::WebSocketStream;
use url::Position;

use crate::observability::metrics;
use crate::proxy::endpoint::ProxyEndpoint;
use crate::proxy::error::{BackendError, ProxyError, RejectedResponse};
use crate::proxy::upgrader::header_has_token;

/// The backend side of a session.
pub type BackendStream = WebSocketStream<TokioIo<Upgraded>>;

/// Largest refusal body kept for the client.
const REJECTION_BODY_LIMIT: usize = 64 * 1024;

/// Open a WebSocket to `endpoint`.
///
/// `headers` replace any of the same name the handshake would carry by
/// default, in particular Host.
pub async fn connect(
    endpoint: &ProxyEndpoint,
    headers: HeaderMap,
    timeout: Duration,
    config: WebSocketConfig,
) -> Result<(BackendStream, HeaderMap), ProxyError> {
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, handshake(endpoint, headers, config)).await {
        Err(_) => Err(ProxyError::BackendTimeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis(),
        }),
        Ok(Err(source)) => Err(ProxyError::BackendUnavailable {
            endpoint: endpoint.to_string(),
            source,
        }),
        Ok(Ok(connected)) => Ok(connected),
    };
    metrics::record_backend_connect(result.is_ok(), started.elapsed());

    match &result {
        Ok(_) => tracing::debug!(%endpoint, elapsed_ms = started.elapsed().as_millis() as u64, "backend connected"),
        Err(error) => tracing::warn!(%endpoint, error = %error, "backend connect failed"),
    }
    result
}

async fn handshake(
    endpoint: &ProxyEndpoint,
    headers: HeaderMap,
    config: WebSocketConfig,
) -> Result<(BackendStream, HeaderMap), BackendError> {
    let url = endpoint.url();
    let host = url
        .host_str()
        .ok_or_else(|| BackendError::Address(format!("{endpoint} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| BackendError::Address(format!("{endpoint} has no port")))?;

    let key = generate_key();
    let request = upgrade_request(endpoint, &key, headers)?;

    let tcp = TcpStream::connect(format!("{host}:{port}")).await?;
    tcp.set_nodelay(true)?;
    let response = if endpoint.is_secure() {
        let name = ServerName::try_from(host.trim_start_matches('[').trim_end_matches(']'))
            .map_err(|_| BackendError::Address(format!("{host} is not a valid TLS server name")))?
            .to_owned();
        let tls = tls_connector()?.connect(name, tcp).await?;
        send(tls, request).await?
    } else {
        send(tcp, request).await?
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(BackendError::Rejected(rejection(response).await));
    }
    if !header_has_token(response.headers(), header::UPGRADE, "websocket") {
        return Err(BackendError::Protocol("missing `Upgrade: websocket`"));
    }
    let accept = response
        .headers()
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .ok_or(BackendError::Protocol("missing `Sec-WebSocket-Accept`"))?;
    if accept.as_bytes() != derive_accept_key(key.as_bytes()).as_bytes() {
        return Err(BackendError::Protocol("`Sec-WebSocket-Accept` does not match the key"));
    }

    let response_headers = response.headers().clone();
    let upgraded = hyper::upgrade::on(response).await?;
    let stream = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, Some(config)).await;
    Ok((stream, response_headers))
}

/// The GET that asks the backend to switch protocols.
fn upgrade_request(endpoint: &ProxyEndpoint, key: &str, headers: HeaderMap) -> Result<Request<Body>, BackendError> {
    let url = endpoint.url();
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(&url[Position::BeforePath..Position::AfterQuery])
        .header(header::HOST, &url[Position::BeforeHost..Position::AfterPort])
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, key)
        .body(Body::empty())?;
    request.headers_mut().extend(headers);
    Ok(request)
}

/// Send `request` on a fresh HTTP/1.1 connection over `io`.
async fn send<I>(io: I, request: Request<Body>) -> Result<Response<Incoming>, BackendError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(error) = connection.with_upgrades().await {
            tracing::debug!(error = %error, "backend handshake connection ended");
        }
    });
    Ok(sender.send_request(request).await?)
}

async fn rejection(response: Response<Incoming>) -> RejectedResponse {
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(Body::new(body), REJECTION_BODY_LIMIT)
        .await
        .unwrap_or_default();
    Response::from_parts(parts, body)
}

fn tls_connector() -> Result<TlsConnector, BackendError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request as ServerRequest, Response as ServerResponse};
    use tokio_tungstenite::tungstenite::Message;

    fn endpoint(addr: std::net::SocketAddr) -> ProxyEndpoint {
        ProxyEndpoint::new(format!("ws://{addr}/feed?room=1").parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn refused_dial_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(
            &endpoint(addr),
            HeaderMap::new(),
            Duration::from_secs(2),
            WebSocketConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::BackendUnavailable { source: BackendError::Io(_), .. }
        ));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        // Accepts TCP but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let err = connect(
            &endpoint(addr),
            HeaderMap::new(),
            Duration::from_millis(100),
            WebSocketConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::BackendTimeout { timeout_ms: 100, .. }));
    }

    #[tokio::test]
    async fn host_header_is_overridden() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let _ws = tokio_tungstenite::accept_hdr_async(socket, |request: &ServerRequest, response| {
                seen = Some((request.uri().to_string(), request.headers()[header::HOST].clone()));
                Ok(response)
            })
            .await
            .unwrap();
            seen
        });

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "public.example:7777".parse().unwrap());
        let _ = connect(&endpoint(addr), headers, Duration::from_secs(2), WebSocketConfig::default())
            .await
            .unwrap();

        let (target, host) = seen.await.unwrap().unwrap();
        assert_eq!(target, "/feed?room=1");
        assert_eq!(host, "public.example:7777");
    }

    #[tokio::test]
    async fn backend_may_decline_every_offer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Never sets Sec-WebSocket-Protocol.
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::text("hello")).await.unwrap();
            let _ = ws.next().await;
        });

        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat-v9"));
        let (mut stream, response) =
            connect(&endpoint(addr), headers, Duration::from_secs(2), WebSocketConfig::default())
                .await
                .unwrap();

        assert!(!response.contains_key(header::SEC_WEBSOCKET_PROTOCOL));
        assert_eq!(stream.next().await.unwrap().unwrap(), Message::text("hello"));
    }

    #[tokio::test]
    async fn refusal_is_kept_whole() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_hdr_async(socket, |_: &ServerRequest, _: ServerResponse| {
                let mut refusal = tokio_tungstenite::tungstenite::handshake::server::ErrorResponse::new(
                    Some("no ticket".to_string()),
                );
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            })
            .await;
        });

        let err = connect(&endpoint(addr), HeaderMap::new(), Duration::from_secs(2), WebSocketConfig::default())
            .await
            .unwrap_err();
        let refusal = match err {
            ProxyError::BackendUnavailable { source: BackendError::Rejected(refusal), .. } => refusal,
            other => panic!("expected a relayed refusal, got {other:?}"),
        };
        assert_eq!(refusal.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(refusal.body().as_ref(), b"no ticket");
    }

    #[tokio::test]
    async fn secure_endpoint_speaks_tls_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let first_byte = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            byte[0]
        });

        let endpoint = ProxyEndpoint::new(format!("wss://{addr}/").parse().unwrap()).unwrap();
        let err = connect(&endpoint, HeaderMap::new(), Duration::from_secs(2), WebSocketConfig::default())
            .await
            .unwrap_err();

        // 0x16 opens a TLS handshake record; a plain upgrade would start with "G".
        assert_eq!(first_byte.await.unwrap(), 0x16);
        assert!(matches!(
            err,
            ProxyError::BackendUnavailable { source: BackendError::Io(_), .. }
        ));
    }

    #[tokio::test]
    async fn wrong_accept_key_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\n\
                      Connection: Upgrade\r\n\
                      Upgrade: websocket\r\n\
                      Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
                )
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = connect(&endpoint(addr), HeaderMap::new(), Duration::from_secs(2), WebSocketConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::BackendUnavailable { source: BackendError::Protocol(_), .. }
        ));
    }
}
