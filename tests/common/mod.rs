//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::server::{ErrorResponse, Request, Response},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use websocket_proxy::config::Config;
use websocket_proxy::{HttpServer, Shutdown, StaticBackend, WebSocketProxy};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subprotocol the test backend accepts when offered.
pub const BACKEND_PROTOCOL: &str = "test-protocol";

/// What a test backend does once its handshake completes.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Echo text and binary messages back.
    Echo,
    /// Close right away with the given code and reason.
    CloseWith(u16, &'static str),
}

/// A running test backend and what it has observed.
pub struct Backend {
    pub addr: SocketAddr,
    /// Headers of every handshake, in arrival order.
    pub handshakes: mpsc::UnboundedReceiver<HeaderMap>,
    /// Every message read, control frames included.
    pub received: mpsc::UnboundedReceiver<Message>,
}

impl Backend {
    pub async fn next_handshake(&mut self) -> HeaderMap {
        tokio::time::timeout(Duration::from_secs(2), self.handshakes.recv())
            .await
            .expect("backend saw no handshake")
            .unwrap()
    }

    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("backend received nothing")
            .unwrap()
    }
}

/// Start a WebSocket backend on an ephemeral port.
pub async fn start_backend(behavior: Behavior) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handshake_tx, handshakes) = mpsc::unbounded_channel();
    let (message_tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let handshake_tx = handshake_tx.clone();
            let message_tx = message_tx.clone();
            tokio::spawn(async move {
                let callback = |request: &Request, mut response: Response| {
                    let headers = request.headers().clone();
                    let offered = headers
                        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
                        .iter()
                        .filter_map(|v| v.to_str().ok())
                        .flat_map(|v| v.split(','))
                        .any(|p| p.trim() == BACKEND_PROTOCOL);
                    if offered {
                        response.headers_mut().insert(
                            header::SEC_WEBSOCKET_PROTOCOL,
                            HeaderValue::from_static(BACKEND_PROTOCOL),
                        );
                    }
                    response
                        .headers_mut()
                        .append(header::SET_COOKIE, HeaderValue::from_static("backend=1"));
                    let _ = handshake_tx.send(headers);
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
                    return;
                };

                if let Behavior::CloseWith(code, reason) = behavior {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }))
                        .await;
                    // Drain until the proxy answers the close.
                    while let Some(Ok(_)) = ws.next().await {}
                    return;
                }

                while let Some(Ok(message)) = ws.next().await {
                    let _ = message_tx.send(message.clone());
                    if (message.is_text() || message.is_binary())
                        && ws.send(message).await.is_err()
                    {
                        break;
                    }
                }
            });
        }
    });

    Backend {
        addr,
        handshakes,
        received,
    }
}

/// Start a backend that refuses every upgrade with `status`.
pub async fn start_rejecting_backend(status: StatusCode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let callback = move |_: &Request, _: Response| {
                    let mut rejection = ErrorResponse::new(Some("denied by backend".to_string()));
                    *rejection.status_mut() = status;
                    Err(rejection)
                };
                let _ = tokio_tungstenite::accept_hdr_async(socket, callback).await;
            });
        }
    });

    addr
}

/// Start a TCP listener that accepts and then never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    addr
}

/// Start a backend that waits `delay` before answering the handshake, then
/// reads until the connection ends.
pub async fn start_slow_backend(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start the proxy on an ephemeral port in front of `backend`.
pub async fn start_proxy(
    backend: SocketAddr,
    configure: impl FnOnce(&mut Config),
) -> (SocketAddr, Shutdown) {
    let mut config = Config::default();
    config.backend.url = format!("ws://{backend}");
    config.observability.metrics_enabled = false;
    configure(&mut config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, shutdown.clone()).unwrap();
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });

    (addr, shutdown)
}

/// Start the proxy with sessions bound to their own shutdown, so triggering
/// it closes sessions while the listener keeps serving.
pub async fn start_proxy_with_session_shutdown(backend: SocketAddr) -> (SocketAddr, Shutdown) {
    let mut config = Config::default();
    config.backend.url = format!("ws://{backend}");
    config.observability.metrics_enabled = false;

    let sessions = Shutdown::new();
    let proxy = WebSocketProxy::new(StaticBackend::parse(&config.backend.url).unwrap(), None)
        .with_shutdown(sessions.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let listening = Shutdown::new();
    let server = HttpServer::with_proxy(config, proxy, listening.clone());
    tokio::spawn(async move {
        let _listening = listening;
        let _ = server.run(listener).await;
    });

    (addr, sessions)
}

/// Open a client WebSocket through the proxy with extra request headers.
pub async fn connect(
    proxy: SocketAddr,
    path: &str,
    headers: &[(header::HeaderName, &str)],
) -> Result<(Client, HeaderMap), tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{proxy}{path}").into_client_request()?;
    for (name, value) in headers {
        request
            .headers_mut()
            .append(name.clone(), HeaderValue::from_str(value).unwrap());
    }
    let (client, response) = tokio_tungstenite::connect_async(request).await?;
    Ok((client, response.headers().clone()))
}

/// Next data or close message from the client side, skipping pongs.
pub async fn next_from_proxy(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("proxy sent nothing")
            .expect("client stream ended")
            .expect("client read failed");
        if !message.is_pong() {
            return message;
        }
    }
}
