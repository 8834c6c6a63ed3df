//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, upgrade route, middleware)
//!     → request.rs (assign or keep X-Request-Id)
//!     → proxy::WebSocketProxy::handle (101 or error response)
//!     → connection handed to the session task after 101
//! ```

pub mod request;
pub mod server;

pub use request::{request_id_layers, MakeRequestUuid, X_REQUEST_ID};
pub use server::HttpServer;
