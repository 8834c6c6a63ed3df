//! WebSocket reverse proxy core.
//!
//! # Data Flow
//! ```text
//! Client upgrade request
//!     → upgrader.rs (validate, origin policy)
//!     → net::connection (admit session)
//!     → endpoint.rs (resolve backend URL)
//!     → handshake.rs (adapt headers)
//!     → connector.rs (dial backend, complete its handshake)
//!     → upgrader.rs (101 to the client, echo backend headers)
//!     → session.rs (relay until either side closes)
//!
//! Client ←── relay.rs (two loops, ping.rs on the client side) ──→ Backend
//! ```
//!
//! # Design Decisions
//! - The backend handshake completes before the client sees 101, so a
//!   backend refusal reaches the client as a plain HTTP response
//! - Each session is one spawned task that owns both connections
//! - Messages are relayed whole and unchanged; no buffering beyond one
//!   message per direction

pub mod connector;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod ping;
pub mod relay;
pub mod session;
pub mod upgrader;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::Request,
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use tracing::Instrument;

use crate::config::{ListenerConfig, ProxyConfiguration};
use crate::lifecycle::Shutdown;
use crate::net::SessionTracker;
use crate::observability::metrics;

pub use endpoint::{BackendResolver, ProxyEndpoint, StaticBackend};
pub use error::ProxyError;
pub use handshake::Director;
pub use ping::{PING_MESSAGE, PONG_MESSAGE};
pub use relay::{Direction, Peer, RelayStats, Termination};
pub use session::{Session, SessionReport};
pub use upgrader::{OriginPolicy, Upgrader};

/// Transparent WebSocket reverse proxy.
///
/// Every accepted upgrade becomes one [`Session`] between the client and a
/// backend chosen by the resolver.
pub struct WebSocketProxy {
    resolver: Arc<dyn BackendResolver>,
    config: Arc<ProxyConfiguration>,
    upgrader: Upgrader,
    director: Option<Director>,
    tracker: SessionTracker,
    shutdown: Shutdown,
    secure: bool,
}

impl WebSocketProxy {
    /// Create a proxy. `None` selects the default [`ProxyConfiguration`].
    pub fn new<R: BackendResolver>(resolver: R, config: Option<ProxyConfiguration>) -> Self {
        Self {
            resolver: Arc::new(resolver),
            config: Arc::new(config.unwrap_or_default()),
            upgrader: Upgrader::default(),
            director: None,
            tracker: SessionTracker::new(ListenerConfig::default().max_sessions),
            shutdown: Shutdown::new(),
            secure: false,
        }
    }

    /// Replace the client-side upgrade settings.
    pub fn with_upgrader(mut self, upgrader: Upgrader) -> Self {
        self.upgrader = upgrader;
        self
    }

    /// Run `director` on every backend-bound header set.
    pub fn with_director(mut self, director: Director) -> Self {
        self.director = Some(director);
        self
    }

    pub fn with_session_limit(mut self, max_sessions: usize) -> Self {
        self.tracker = SessionTracker::new(max_sessions);
        self
    }

    /// Close every session when `shutdown` triggers.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Whether clients reach this proxy over TLS (sets X-Forwarded-Proto).
    pub fn with_tls(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn config(&self) -> &ProxyConfiguration {
        &self.config
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Serve one client upgrade request.
    ///
    /// Returns the 101 response and spawns the session, or the HTTP error
    /// that explains why no session was opened.
    pub async fn handle(&self, request: Request<Body>, remote: Option<SocketAddr>) -> Response {
        match self.establish(request, remote).await {
            Ok(response) => {
                metrics::record_upgrade("accepted");
                response
            }
            Err(error) => {
                metrics::record_upgrade(error.kind());
                tracing::info!(
                    remote = ?remote,
                    status = error.status().as_u16(),
                    error = %error,
                    "Upgrade refused"
                );
                error.into_response()
            }
        }
    }

    async fn establish(
        &self,
        request: Request<Body>,
        remote: Option<SocketAddr>,
    ) -> Result<Response, ProxyError> {
        let shutdown = self.shutdown.signalled();
        let (mut parts, _body) = request.into_parts();

        let handshake = self.upgrader.validate(&parts)?;
        let on_upgrade = parts
            .extensions
            .remove::<OnUpgrade>()
            .ok_or(ProxyError::NotUpgradable)?;
        let guard = self
            .tracker
            .try_admit()
            .ok_or(ProxyError::CapacityExhausted)?;
        let endpoint = self.resolver.resolve(&parts)?;

        let mut headers = handshake::backend_request_headers(&parts, remote, self.secure);
        if let Some(director) = &self.director {
            director(&parts, &mut headers);
        }

        let (mut backend, backend_headers) = connector::connect(
            &endpoint,
            headers,
            self.config.connect_timeout(),
            self.upgrader.websocket_config(),
        )
        .await?;

        let response = self.upgrader.switching_protocols(
            &handshake,
            handshake::client_response_headers(
                &backend_headers,
                &handshake::offered_subprotocols(&parts.headers),
                self.upgrader.subprotocols(),
            ),
        );

        let id = guard.id();
        let span = tracing::info_span!("session", session_id = %id, backend = %endpoint);
        let upgrader = self.upgrader.clone();
        let config = Arc::clone(&self.config);

        tokio::spawn(
            async move {
                let client = match upgrader.upgrade(on_upgrade).await {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!(error = %e, "Client upgrade failed, closing backend");
                        let _ = backend.close(None).await;
                        return;
                    }
                };

                tracing::info!(remote = ?remote, "Session opened");
                metrics::session_opened();
                let report = Session::new(id, client, backend, config).run(shutdown).await;
                metrics::session_closed();

                let clean = report.outcome.as_ref().map_or(true, Termination::is_clean);
                if clean {
                    tracing::info!(
                        outcome = ?report.outcome,
                        client_messages = report.client_to_backend.messages,
                        backend_messages = report.backend_to_client.messages,
                        duration_ms = report.duration.as_millis() as u64,
                        "Session closed"
                    );
                } else {
                    tracing::warn!(
                        outcome = ?report.outcome,
                        client_messages = report.client_to_backend.messages,
                        backend_messages = report.backend_to_client.messages,
                        duration_ms = report.duration.as_millis() as u64,
                        "Session closed on error"
                    );
                }
                drop(guard);
            }
            .instrument(span),
        );

        Ok(response)
    }
}
