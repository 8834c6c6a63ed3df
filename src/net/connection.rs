//! Session identity and admission tracking.
//!
//! # Responsibilities
//! - Generate unique session IDs for tracing
//! - Bound the number of concurrent sessions
//! - Count live sessions for graceful shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Global atomic counter for session IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a proxied session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Admits sessions up to a limit and counts the live ones.
///
/// A slot is taken before the backend is dialed and released when the
/// returned guard drops, i.e. when the session (or a failed handshake) ends.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    limit: Arc<Semaphore>,
    active_count: Arc<AtomicU64>,
    max_sessions: usize,
}

impl SessionTracker {
    /// Create a tracker admitting at most `max_sessions` concurrent sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            limit: Arc::new(Semaphore::new(max_sessions)),
            active_count: Arc::new(AtomicU64::new(0)),
            max_sessions,
        }
    }

    /// Take a slot without waiting. `None` when the limit is reached.
    pub fn try_admit(&self) -> Option<SessionGuard> {
        let permit = self.limit.clone().try_acquire_owned().ok()?;
        self.active_count.fetch_add(1, Ordering::SeqCst);
        Some(SessionGuard {
            _permit: permit,
            active_count: Arc::clone(&self.active_count),
            id: SessionId::new(),
        })
    }

    /// Get current live session count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Get configured maximum sessions.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Wait until every session has ended or the deadline passes.
    /// Returns whether the tracker drained.
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let drained = async {
            while self.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(deadline, drained).await.is_ok()
    }
}

/// Guard held for a session's lifetime.
/// Releases the slot and decrements the live count when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicU64>,
    id: SessionId,
}

impl SessionGuard {
    /// Get this session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(session_id = %self.id, "Session slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn tracker_enforces_limit() {
        let tracker = SessionTracker::new(2);
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.try_admit().unwrap();
        let guard2 = tracker.try_admit().unwrap();
        assert_eq!(tracker.active_count(), 2);
        assert!(tracker.try_admit().is_none());

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        let guard3 = tracker.try_admit().unwrap();
        assert_ne!(guard2.id(), guard3.id());
    }

    #[tokio::test]
    async fn wait_idle_reports_drain() {
        let tracker = SessionTracker::new(1);
        let guard = tracker.try_admit().unwrap();
        assert!(!tracker.wait_idle(Duration::from_millis(60)).await);

        drop(guard);
        assert!(tracker.wait_idle(Duration::from_millis(60)).await);
    }
}
