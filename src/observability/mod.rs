//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Handshake, relay and session code produce:
//!     → logging.rs (structured log events, one span per session)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows from the HTTP layer into the backend handshake
//! - Metrics are cheap (atomic increments) and recorded unconditionally;
//!   without an installed exporter they are no-ops

pub mod logging;
pub mod metrics;
