//! Client ping interception.
//!
//! When `support_client_ping_pong` is on, liveness checks sent by the client
//! are answered by the proxy and never reach the backend. Two kinds of ping
//! are recognised:
//!
//! - protocol `Ping` control frames. The client connection already queues a
//!   mirrored `Pong` for every ping it reads and flushes it on the next read,
//!   so the interceptor only has to keep the frame away from the backend.
//! - binary messages whose payload is exactly [`PING_MESSAGE`]. These are
//!   answered with a binary [`PONG_MESSAGE`] pushed to the client writer.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Payload of an application-level ping probe.
pub const PING_MESSAGE: &[u8] = b"ping";

/// Payload the proxy answers an application-level ping with.
pub const PONG_MESSAGE: &[u8] = b"pong";

/// What the client-to-backend loop should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not a ping; relay it to the backend.
    Forward,
    /// Answered by the proxy; drop it.
    Answered,
}

/// Answers client pings on the backend's behalf.
#[derive(Debug, Clone)]
pub struct PingInterceptor {
    /// Queue drained by the task that owns the client write half.
    replies: mpsc::Sender<Message>,
}

impl PingInterceptor {
    pub fn new(replies: mpsc::Sender<Message>) -> Self {
        Self { replies }
    }

    /// Inspect a message read from the client.
    pub async fn inspect(&self, message: &Message) -> Verdict {
        match message {
            Message::Ping(payload) => {
                tracing::trace!(len = payload.len(), "client ping answered by proxy");
                Verdict::Answered
            }
            Message::Binary(payload) if payload.as_ref() == PING_MESSAGE => {
                // The writer is gone only when the session is already tearing down.
                if self.replies.send(Message::binary(PONG_MESSAGE)).await.is_err() {
                    tracing::debug!("client writer closed, pong dropped");
                }
                Verdict::Answered
            }
            _ => Verdict::Forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sentinel_ping_gets_sentinel_pong() {
        let (tx, mut rx) = mpsc::channel(1);
        let interceptor = PingInterceptor::new(tx);

        let verdict = interceptor.inspect(&Message::binary(PING_MESSAGE)).await;

        assert_eq!(verdict, Verdict::Answered);
        assert_eq!(rx.recv().await, Some(Message::binary(PONG_MESSAGE)));
    }

    #[tokio::test]
    async fn control_ping_is_kept_from_backend() {
        let (tx, mut rx) = mpsc::channel(1);
        let interceptor = PingInterceptor::new(tx);

        let verdict = interceptor.inspect(&Message::Ping(b"probe".to_vec().into())).await;

        assert_eq!(verdict, Verdict::Answered);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_messages_are_forwarded() {
        let (tx, _rx) = mpsc::channel(1);
        let interceptor = PingInterceptor::new(tx);

        for message in [
            Message::text("ping"),
            Message::binary(b"ping!".to_vec()),
            Message::Pong(Vec::<u8>::new().into()),
        ] {
            assert_eq!(interceptor.inspect(&message).await, Verdict::Forward);
        }
    }
}
