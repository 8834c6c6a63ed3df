//! Transparent WebSocket reverse proxy library.
//!
//! Accepts client WebSocket upgrades, opens a matching WebSocket to a
//! backend, and relays messages both ways until either side closes.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::schema::{Config, ProxyConfiguration};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::{
    BackendResolver, ProxyEndpoint, ProxyError, StaticBackend, WebSocketProxy, PING_MESSAGE,
    PONG_MESSAGE,
};
