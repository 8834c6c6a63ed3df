//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the upgrade handler on the configured path
//! - Wire up middleware (tracing, handshake timeout, request ID)
//! - Bind server to a plain or TLS listener
//! - Stop accepting on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::Config;
use crate::http::request::request_id_layers;
use crate::lifecycle::Shutdown;
use crate::net::tls::{load_tls_config, ListenerError};
use crate::proxy::{ProxyError, StaticBackend, Upgrader, WebSocketProxy};

/// HTTP front of the WebSocket proxy.
pub struct HttpServer {
    router: Router,
    proxy: Arc<WebSocketProxy>,
    config: Config,
    shutdown: Shutdown,
}

impl HttpServer {
    /// Build the proxy and its router from `config`.
    pub fn new(config: Config, shutdown: Shutdown) -> Result<Self, ProxyError> {
        let backend = StaticBackend::parse(&config.backend.url)?;
        let proxy = WebSocketProxy::new(backend, Some(config.proxy.clone()))
            .with_upgrader(Upgrader::from_config(&config.upgrader))
            .with_session_limit(config.listener.max_sessions)
            .with_shutdown(shutdown.clone())
            .with_tls(config.listener.tls.is_some());
        Ok(Self::with_proxy(config, proxy, shutdown))
    }

    /// Serve an already-built proxy (custom resolver, director, origin check).
    pub fn with_proxy(config: Config, proxy: WebSocketProxy, shutdown: Shutdown) -> Self {
        let proxy = Arc::new(proxy);
        let router = Self::build_router(&config, Arc::clone(&proxy));
        Self {
            router,
            proxy,
            config,
            shutdown,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &Config, proxy: Arc<WebSocketProxy>) -> Router {
        let path = config.listener.path.as_str();
        let router = if path == "/" {
            Router::new()
                .route("/", any(upgrade_handler))
                .route("/{*path}", any(upgrade_handler))
        } else {
            Router::new().route(path, any(upgrade_handler))
        };
        let (set_request_id, propagate_request_id) = request_id_layers();

        router.with_state(proxy).layer(
            ServiceBuilder::new()
                .layer(set_request_id)
                .layer(TraceLayer::new_for_http())
                .layer(propagate_request_id)
                .layer(TimeoutLayer::new(Duration::from_secs(
                    config.timeouts.handshake_secs,
                ))),
        )
    }

    /// The proxy behind this server, e.g. to wait for sessions to drain.
    pub fn proxy(&self) -> Arc<WebSocketProxy> {
        Arc::clone(&self.proxy)
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, path = %self.config.listener.path, "HTTP server starting");

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(self.shutdown.signalled())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run the server over TLS on `addr` using the configured certificate.
    pub async fn run_tls(self, addr: SocketAddr) -> Result<(), ListenerError> {
        let Some(tls) = self.config.listener.tls.as_ref() else {
            return Err(ListenerError::NotConfigured);
        };
        let rustls = load_tls_config(tls).await?;
        tracing::info!(address = %addr, path = %self.config.listener.path, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let stopping = handle.clone();
        let signalled = self.shutdown.signalled();
        tokio::spawn(async move {
            signalled.await;
            stopping.graceful_shutdown(Some(Duration::from_secs(1)));
        });

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(app)
            .await
            .map_err(ListenerError::Serve)?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Every request on the proxy path is an upgrade attempt.
async fn upgrade_handler(
    State(proxy): State<Arc<WebSocketProxy>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    tracing::debug!(
        request_id = %request_id,
        remote = %remote,
        path = %request.uri().path(),
        "Upgrade request"
    );

    proxy.handle(request, Some(remote)).await
}
