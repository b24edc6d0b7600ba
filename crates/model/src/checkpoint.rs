//! Checkpoint store contract.
//!
//! The store is a keyed blob store mapping `(contextId, operatorSequence)` to
//! a serialized row stream. It is best-effort and lossy-tolerant: a failed
//! write degrades future recovery speed but never fails the originating task.
//! At-most-one-writer-per-key semantics are assumed at the collaborator level.

use std::fmt;

use async_trait::async_trait;
use pq_common::{ContextId, Result};

use crate::row::BoxRowStream;

/// Deterministic, collision-free checkpoint key within one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub context_id: ContextId,
    pub first_op_sequence: u64,
}

impl CheckpointKey {
    pub fn new(context_id: ContextId, first_op_sequence: u64) -> Self {
        Self {
            context_id,
            first_op_sequence,
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context_id, self.first_op_sequence)
    }
}

/// Keyed row-stream blob store with size-aware cost estimators.
///
/// The estimator pair feeds every cost-model input the greedy policy uses.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a row-stream snapshot. Returns `false` when the store declined
    /// the write (e.g. key already present).
    async fn store(&self, key: CheckpointKey, stream: BoxRowStream) -> Result<bool>;

    /// Load a previously persisted snapshot.
    async fn load(&self, key: CheckpointKey) -> Result<BoxRowStream>;

    /// Estimated wall-clock cost (ms) of persisting `bytes`.
    fn estimate_persist_time_ms(&self, bytes: u64) -> f64;

    /// Estimated wall-clock cost (ms) of loading `bytes` back.
    fn estimate_load_time_ms(&self, bytes: u64) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_context_scoped() {
        let key = CheckpointKey::new(ContextId(12), 3);
        assert_eq!(key.to_string(), "12/3");
    }
}
