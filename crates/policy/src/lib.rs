//! Checkpoint (fault-tolerance) policy.
//!
//! Architecture role:
//! - wraps a pure decision function `need_persistence(task, result)` in the
//!   template method [`PersistencePolicy::persistence`], invoked by the
//!   dispatcher on every completed task;
//! - offers three interchangeable strategies: [`default_policy`] (seeded
//!   coin flip), [`naive`] (static span threshold), [`greedy`]
//!   (budget-constrained cost propagation along the task DAG).
//!
//! Checkpointing is strictly best-effort: a failed store write is logged and
//! counted, never surfaced to the originating task.

pub mod default_policy;
pub mod greedy;
pub mod naive;

use std::sync::Arc;

use pq_common::{global_metrics, EngineConfig, FaultTolerancePolicyKind, PqError};
use pq_model::row::{drain_stream_partial, Header, MemTable, Row, RowStream};
use pq_model::{CheckpointStore, PhysicalTask, TaskResult};
use tracing::{debug, warn};

pub use default_policy::DefaultPolicy;
pub use greedy::GreedyPolicy;
pub use naive::NaivePolicy;

/// Pure persistence decision, dispatched per configured strategy.
///
/// Implementations may finalize the task's cost state as a side effect (the
/// greedy strategy does; the others leave it untouched).
pub trait DecisionStrategy: Send + Sync {
    fn need_persistence(&self, task: &PhysicalTask, estimated_size_bytes: u64) -> bool;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Template method around the configured [`DecisionStrategy`].
pub struct PersistencePolicy {
    shared_storage_enabled: bool,
    store: Arc<dyn CheckpointStore>,
    strategy: Box<dyn DecisionStrategy>,
}

impl PersistencePolicy {
    /// Build the policy selected by `config.fault_tolerance_policy`.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn CheckpointStore>) -> Self {
        let max_bytes = config.max_persist_size_bytes();
        let strategy: Box<dyn DecisionStrategy> = match config.fault_tolerance_policy {
            FaultTolerancePolicyKind::Default => {
                Box::new(DefaultPolicy::new(max_bytes, config.default_policy_seed))
            }
            FaultTolerancePolicyKind::Naive => Box::new(NaivePolicy::new(
                max_bytes,
                config.max_cost_ratio,
                Arc::clone(&store),
            )),
            FaultTolerancePolicyKind::Greedy => Box::new(GreedyPolicy::new(
                max_bytes,
                config.max_cost_ratio,
                Arc::clone(&store),
            )),
        };
        Self {
            shared_storage_enabled: config.shared_storage_enabled,
            store,
            strategy,
        }
    }

    /// Build around an explicit strategy (used by tests and embedders).
    pub fn with_strategy(
        shared_storage_enabled: bool,
        store: Arc<dyn CheckpointStore>,
        strategy: Box<dyn DecisionStrategy>,
    ) -> Self {
        Self {
            shared_storage_enabled,
            store,
            strategy,
        }
    }

    /// Decision without side effects on the result.
    pub fn need_persistence(&self, task: &PhysicalTask, result: &TaskResult) -> bool {
        if !result.is_ok() {
            return false;
        }
        self.strategy
            .need_persistence(task, result.estimated_size_bytes())
    }

    /// Persist the task's output when the strategy says so.
    ///
    /// No-op unless shared storage is enabled and the task carries an
    /// execution context. On a persist decision the result's stream is
    /// rewritten with a replayable, tee'd copy so the checkpoint write and the
    /// downstream consumer observe the same rows.
    pub async fn persistence(&self, task: &PhysicalTask, result: &mut TaskResult) {
        if !self.shared_storage_enabled {
            return;
        }
        let Some(key) = task.checkpoint_key() else {
            return;
        };
        if !self.need_persistence(task, result) {
            return;
        }
        let Some(mut stream) = result.take_stream() else {
            return;
        };

        let (table, drain_err) = drain_stream_partial(stream.as_mut());
        if let Some(err) = drain_err {
            // The read failure belongs to the consumer (the repeater will
            // replay it); re-surface the rows read so far, then the error.
            warn!(
                context_id = %key.context_id,
                error = %err,
                "stream failed while tee'ing for checkpoint; forwarding partial rows"
            );
            result.replace_stream(Box::new(ReplayThenError::new(table, err)));
            return;
        }

        let bytes = table.estimated_size_bytes();
        match self
            .store
            .store(key, Box::new(table.clone().into_stream()))
            .await
        {
            Ok(true) => {
                debug!(
                    strategy = self.strategy.name(),
                    context_id = %key.context_id,
                    sequence = key.first_op_sequence,
                    bytes,
                    "persisted task output"
                );
                global_metrics().inc_checkpoint_persisted(&key.context_id.to_string(), bytes);
            }
            Ok(false) => {
                debug!(
                    context_id = %key.context_id,
                    sequence = key.first_op_sequence,
                    "checkpoint store declined write"
                );
            }
            Err(err) => {
                // Best-effort: degraded recovery speed, never a task failure.
                warn!(
                    context_id = %key.context_id,
                    sequence = key.first_op_sequence,
                    error = %err,
                    "checkpoint persist failed"
                );
                global_metrics().inc_checkpoint_persist_failure(&key.context_id.to_string());
            }
        }
        result.replace_stream(Box::new(table.into_stream()));
    }
}

/// Replays a prefix of rows, then yields a stored error exactly once.
struct ReplayThenError {
    table: MemTable,
    pos: usize,
    error: Option<PqError>,
}

impl ReplayThenError {
    fn new(table: MemTable, error: PqError) -> Self {
        Self {
            table,
            pos: 0,
            error: Some(error),
        }
    }
}

impl RowStream for ReplayThenError {
    fn header(&self) -> &Header {
        self.table.header()
    }

    fn next_row(&mut self) -> pq_common::Result<Option<Row>> {
        if let Some(row) = self.table.rows().get(self.pos).cloned() {
            self.pos += 1;
            return Ok(Some(row));
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    fn estimated_size_bytes(&self) -> u64 {
        self.table.estimated_size_bytes()
    }
}
