//! Closed-session tracking.
//!
//! Cancellation is cooperative: the dispatch loop drops tasks whose session
//! has closed at queue-pop time, but an already-running task is never
//! interrupted mid-flight.

use std::collections::HashSet;

use parking_lot::RwLock;
use pq_common::SessionId;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    closed: RwLock<HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a session closed; tasks it submitted are dropped at dispatch.
    pub fn close(&self, session: SessionId) {
        self.closed.write().insert(session);
    }

    pub fn is_closed(&self, session: SessionId) -> bool {
        self.closed.read().contains(&session)
    }

    /// Forget a closed session once its last task has drained.
    pub fn forget(&self, session: SessionId) {
        self.closed.write().remove(&session);
    }
}
