//! Relay engine: the two one-directional copy loops of a session.
//!
//! # Responsibilities
//! - Client → backend: read a message, offer it to the ping interceptor,
//!   write it to the backend unchanged
//! - Backend → client: read a message, write it to the client unchanged;
//!   also the single writer for pongs produced by the interceptor
//! - Turn the first read/write failure or close frame into a [`Termination`]
//!
//! # Design Decisions
//! - One message in flight per direction: read, write, flush, then read again
//! - Close frames are never relayed as data; they end the direction and the
//!   code/reason travels through the session outcome
//! - Reads race the teardown signal; writes are never interrupted so a peer
//!   never sees half a frame

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};

use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::ping::{PingInterceptor, Verdict};
use crate::proxy::session::OutcomeSlot;

/// Close reason sent when a relay fails; the error itself is only logged.
const UPSTREAM_ERROR_REASON: &str = "upstream error";

/// One end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Backend,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client => write!(f, "client"),
            Peer::Backend => write!(f, "backend"),
        }
    }
}

/// One of the two relay loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a relay direction (or the whole session) ended.
#[derive(Debug)]
pub enum Termination {
    /// A peer sent a close frame or finished the closing handshake.
    PeerClose {
        peer: Peer,
        frame: Option<CloseFrame>,
    },
    /// A read or write failed.
    Failed(ProxyError),
    /// The proxy is shutting down.
    Shutdown,
    /// The other direction terminated first.
    Teardown,
}

impl Termination {
    /// Close frame sent to peers whose connection is still open.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        match self {
            Termination::PeerClose { frame, .. } => frame.clone(),
            Termination::Failed(_) => Some(CloseFrame {
                code: CloseCode::Error,
                reason: UPSTREAM_ERROR_REASON.into(),
            }),
            Termination::Shutdown => Some(CloseFrame {
                code: CloseCode::Away,
                reason: "proxy shutting down".into(),
            }),
            Termination::Teardown => Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }),
        }
    }

    /// Whether this is an orderly end rather than a transport error.
    pub fn is_clean(&self) -> bool {
        !matches!(self, Termination::Failed(_))
    }
}

/// Per-direction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages: u64,
    pub bytes: u64,
}

impl RelayStats {
    fn record(&mut self, direction: Direction, len: usize) {
        self.messages += 1;
        self.bytes += len as u64;
        metrics::record_message(direction.as_str(), len);
    }
}

/// What a relay loop shares with the rest of its session.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    slot: Arc<OutcomeSlot>,
    teardown: watch::Receiver<bool>,
    close_timeout: Duration,
}

impl Link {
    pub(crate) fn new(
        slot: Arc<OutcomeSlot>,
        teardown: watch::Receiver<bool>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            slot,
            teardown,
            close_timeout,
        }
    }

    /// Resolves once the coordinator starts tearing the session down.
    async fn torn_down(&mut self) {
        // A dropped sender means the coordinator is gone: treat it the same.
        let _ = self.teardown.wait_for(|down| *down).await;
    }

    /// Record the outcome, then close the half this direction writes to.
    async fn finish<K>(&self, direction: Direction, termination: Termination, sink: &mut K)
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match &termination {
            Termination::Failed(error) => {
                tracing::warn!(%direction, error = %error, "relay failed");
            }
            Termination::PeerClose { peer, frame } => {
                tracing::debug!(
                    %direction,
                    %peer,
                    code = frame.as_ref().map(|f| u16::from(f.code)),
                    "peer closed"
                );
            }
            Termination::Shutdown | Termination::Teardown => {
                tracing::debug!(%direction, "relay stopped by teardown");
            }
        }

        if !self.slot.record(termination) {
            tracing::trace!(%direction, "session outcome already decided");
        }

        let frame = self.slot.close_frame();
        let close = async {
            // Errors here only mean the peer is already gone.
            let _ = sink.send(Message::Close(frame)).await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(self.close_timeout, close).await.is_err() {
            tracing::debug!(%direction, "close did not complete in time");
        }
    }
}

/// Map the next item of a source stream to a message or a termination.
fn classify(
    next: Option<Result<Message, tungstenite::Error>>,
    peer: Peer,
) -> Result<Message, Termination> {
    match next {
        Some(Ok(Message::Close(frame))) => Err(Termination::PeerClose { peer, frame }),
        Some(Ok(message)) => Ok(message),
        Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
        | None => Err(Termination::PeerClose { peer, frame: None }),
        Some(Err(source)) => Err(Termination::Failed(ProxyError::RelayRead { peer, source })),
    }
}

/// Copy client messages to the backend until either side stops.
pub(crate) async fn client_to_backend<C, B>(
    mut client: C,
    mut backend: B,
    interceptor: Option<PingInterceptor>,
    mut link: Link,
) -> RelayStats
where
    C: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    B: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let direction = Direction::ClientToBackend;
    let mut stats = RelayStats::default();

    let termination = loop {
        let next = tokio::select! {
            biased;
            _ = link.torn_down() => break Termination::Teardown,
            next = client.next() => next,
        };
        let message = match classify(next, Peer::Client) {
            Ok(message) => message,
            Err(termination) => break termination,
        };

        if let Some(interceptor) = &interceptor {
            if interceptor.inspect(&message).await == Verdict::Answered {
                metrics::record_ping_intercepted();
                continue;
            }
        }

        let len = message.len();
        if let Err(source) = backend.send(message).await {
            break Termination::Failed(ProxyError::RelayWrite {
                peer: Peer::Backend,
                source,
            });
        }
        stats.record(direction, len);
    };

    link.finish(direction, termination, &mut backend).await;
    stats
}

/// Copy backend messages (and interceptor replies) to the client until
/// either side stops.
pub(crate) async fn backend_to_client<B, C>(
    mut backend: B,
    mut client: C,
    mut replies: mpsc::Receiver<Message>,
    mut link: Link,
) -> RelayStats
where
    B: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    C: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let direction = Direction::BackendToClient;
    let mut stats = RelayStats::default();

    let termination = loop {
        let (message, relayed) = tokio::select! {
            biased;
            _ = link.torn_down() => break Termination::Teardown,
            Some(reply) = replies.recv() => (reply, false),
            next = backend.next() => match classify(next, Peer::Backend) {
                Ok(message) => (message, true),
                Err(termination) => break termination,
            },
        };

        let len = message.len();
        if let Err(source) = client.send(message).await {
            break Termination::Failed(ProxyError::RelayWrite {
                peer: Peer::Client,
                source,
            });
        }
        if relayed {
            stats.record(direction, len);
        }
    };

    link.finish(direction, termination, &mut client).await;
    stats
}
