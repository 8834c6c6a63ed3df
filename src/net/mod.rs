//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake via axum-server/rustls)
//!     → HTTP layer routes the upgrade request
//!     → connection.rs (session admission, identity, live count)
//!
//! Session States:
//!     Admitted → Handshaking → Relaying → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded session count prevents resource exhaustion
//! - Each session tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod tls;

pub use connection::{SessionGuard, SessionId, SessionTracker};
