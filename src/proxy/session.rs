//! Session lifecycle: pairing of one client and one backend connection.
//!
//! # Responsibilities
//! - Split both connections and hand each half to exactly one relay task
//! - Hold the write-once outcome slot (first termination wins)
//! - Signal teardown once either direction returns, or on proxy shutdown
//! - Abort a direction that does not finish closing in time
//!
//! # State Transitions
//! ```text
//! Relaying → (first direction returns | shutdown) → TearingDown → Closed
//! ```

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame, Message};
use tracing::Instrument;

use crate::config::ProxyConfiguration;
use crate::net::connection::SessionId;
use crate::observability::metrics;
use crate::proxy::ping::PingInterceptor;
use crate::proxy::relay::{self, Link, RelayStats, Termination};

/// Pongs waiting for the client writer.
const REPLY_QUEUE: usize = 16;

/// First-write-wins record of how a session ended.
#[derive(Debug, Default)]
pub struct OutcomeSlot {
    first: OnceLock<Termination>,
}

impl OutcomeSlot {
    /// Store `termination` unless an outcome exists. Returns whether it was stored.
    pub fn record(&self, termination: Termination) -> bool {
        self.first.set(termination).is_ok()
    }

    pub fn get(&self) -> Option<&Termination> {
        self.first.get()
    }

    /// Close frame derived from the recorded outcome.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.get()
            .map(Termination::close_frame)
            .unwrap_or_else(|| Termination::Teardown.close_frame())
    }

    fn into_inner(self) -> Option<Termination> {
        self.first.into_inner()
    }
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    /// `None` only if a relay task panicked before recording anything.
    pub outcome: Option<Termination>,
    pub client_to_backend: RelayStats,
    pub backend_to_client: RelayStats,
    pub duration: Duration,
}

/// A live pairing of a client-facing and a backend-facing connection.
pub struct Session<C, B> {
    id: SessionId,
    client: C,
    backend: B,
    config: Arc<ProxyConfiguration>,
}

impl<C, B> Session<C, B>
where
    C: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static,
    B: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static,
{
    /// Pair two established connections. Both handshakes must be complete.
    pub fn new(id: SessionId, client: C, backend: B, config: Arc<ProxyConfiguration>) -> Self {
        Self {
            id,
            client,
            backend,
            config,
        }
    }

    /// Relay until the session ends. `shutdown` resolving tears the session
    /// down with a going-away close.
    pub async fn run<F>(self, shutdown: F) -> SessionReport
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let close_timeout = self.config.close_timeout();
        let slot = Arc::new(OutcomeSlot::default());

        let (client_sink, client_stream) = self.client.split();
        let (backend_sink, backend_stream) = self.backend.split();
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);

        // Without interception the reply queue has no sender and stays idle.
        let interceptor = self
            .config
            .support_client_ping_pong
            .then(|| PingInterceptor::new(reply_tx));

        let link = Link::new(slot.clone(), teardown_rx, close_timeout);
        let span = tracing::Span::current();
        let mut upstream = tokio::spawn(
            relay::client_to_backend(client_stream, backend_sink, interceptor, link.clone())
                .instrument(span.clone()),
        );
        let mut downstream = tokio::spawn(
            relay::backend_to_client(backend_stream, client_sink, reply_rx, link)
                .instrument(span),
        );

        let mut client_to_backend = None;
        let mut backend_to_client = None;
        tokio::select! {
            joined = &mut upstream => client_to_backend = Some(joined),
            joined = &mut downstream => backend_to_client = Some(joined),
            _ = shutdown => {
                slot.record(Termination::Shutdown);
            }
        }

        // From here on nothing else is relayed; both halves close.
        teardown_tx.send_replace(true);

        let grace = close_timeout * 2;
        let client_to_backend = match client_to_backend {
            Some(joined) => joined,
            None => settle(upstream, grace).await,
        };
        let backend_to_client = match backend_to_client {
            Some(joined) => joined,
            None => settle(downstream, grace).await,
        };

        let report = SessionReport {
            id: self.id,
            outcome: Arc::try_unwrap(slot).ok().and_then(OutcomeSlot::into_inner),
            client_to_backend: stats_or_default(client_to_backend, self.id),
            backend_to_client: stats_or_default(backend_to_client, self.id),
            duration: started.elapsed(),
        };
        metrics::record_session_end(report.duration);
        report
    }
}

/// Wait for a relay task to finish closing, aborting it past the deadline.
async fn settle(
    mut handle: JoinHandle<RelayStats>,
    grace: Duration,
) -> Result<RelayStats, tokio::task::JoinError> {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::debug!("relay did not stop in time, closing its connection");
            handle.abort();
            handle.await
        }
    }
}

fn stats_or_default(
    joined: Result<RelayStats, tokio::task::JoinError>,
    id: SessionId,
) -> RelayStats {
    joined.unwrap_or_else(|e| {
        if e.is_panic() {
            tracing::error!(session_id = %id, "relay task panicked");
        }
        RelayStats::default()
    })
}
