//! Physical tasks and their execution results.
//!
//! A [`PhysicalTask`] is one or more plan operators bound to a target data
//! area. Tasks form a DAG: parents are upstream stages whose finalized cost
//! state the greedy checkpoint policy reads, and the optional follower is the
//! next stage, scheduled once every parent dependency is satisfied.
//!
//! Span and result are set exactly once, by the worker that executes the
//! task; cost state is finalized exactly once, by the policy's decision.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pq_common::{ContextId, PqError, Result, SessionId, StorageUnitId};

use crate::checkpoint::CheckpointKey;
use crate::fragment::{FragmentMeta, KeyInterval};
use crate::operator::Operator;
use crate::row::BoxRowStream;

/// A task's target: one storage unit and the key interval to touch there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataArea {
    pub unit: StorageUnitId,
    pub key_interval: KeyInterval,
}

/// Cost-model state finalized once per task by the greedy policy.
///
/// Invariant: `redo_cost_ms == min(recompute cost, checkpoint load cost)`,
/// chosen at decision time and never revisited; children read only finalized
/// parent states because the DAG is processed in dependency order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostState {
    /// Cumulative subtree wall-clock span (ms).
    pub total_span_ms: f64,
    /// Estimated output size of this task (bytes).
    pub estimated_size_bytes: u64,
    /// Estimated cost of persisting this task's output (ms).
    pub persist_time_ms: f64,
    /// Estimated cost of reloading a checkpoint of this output (ms).
    pub load_time_ms: f64,
    /// Finalized redo cost (ms).
    pub redo_cost_ms: f64,
    /// Redo cost assuming this task is never persisted (ms).
    pub redo_cost_without_persist_ms: f64,
    /// Persist time charged along this subtree so far (ms).
    pub total_persist_time_ms: f64,
}

/// Execution outcome: exactly one of row stream or error.
enum Outcome {
    Stream(BoxRowStream),
    Failed(PqError),
}

/// Result of executing one storage task.
pub struct TaskResult {
    outcome: Outcome,
    estimated_size_bytes: u64,
}

impl std::fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Outcome::Stream(_) => write!(
                f,
                "TaskResult::Stream(~{} bytes)",
                self.estimated_size_bytes
            ),
            Outcome::Failed(e) => write!(f, "TaskResult::Failed({e})"),
        }
    }
}

impl TaskResult {
    pub fn from_stream(stream: BoxRowStream) -> Self {
        let estimated_size_bytes = stream.estimated_size_bytes();
        Self {
            outcome: Outcome::Stream(stream),
            estimated_size_bytes,
        }
    }

    pub fn from_error(error: PqError) -> Self {
        Self {
            outcome: Outcome::Failed(error),
            estimated_size_bytes: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Stream(_))
    }

    pub fn estimated_size_bytes(&self) -> u64 {
        self.estimated_size_bytes
    }

    pub fn error(&self) -> Option<&PqError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            Outcome::Stream(_) => None,
        }
    }

    /// Take the stream out, leaving the error path untouched.
    pub fn take_stream(&mut self) -> Option<BoxRowStream> {
        match std::mem::replace(
            &mut self.outcome,
            Outcome::Failed(PqError::Execution("result already consumed".to_string())),
        ) {
            Outcome::Stream(s) => Some(s),
            Outcome::Failed(e) => {
                self.outcome = Outcome::Failed(e);
                None
            }
        }
    }

    /// Rewrite the stream with a replayable tee'd version after a checkpoint
    /// write.
    pub fn replace_stream(&mut self, stream: BoxRowStream) {
        self.estimated_size_bytes = stream.estimated_size_bytes();
        self.outcome = Outcome::Stream(stream);
    }

    /// Consume the result into its terminal error, if any.
    pub fn into_error(self) -> Option<PqError> {
        match self.outcome {
            Outcome::Failed(e) => Some(e),
            Outcome::Stream(_) => None,
        }
    }
}

/// A unit of work: plan operators bound to a target data area.
pub struct PhysicalTask {
    operators: Vec<Operator>,
    fragment: FragmentMeta,
    key_interval: KeyInterval,
    context_id: Option<ContextId>,
    session_id: Option<SessionId>,
    needs_broadcasting: bool,
    is_sync: bool,
    span_ms: AtomicU64,
    span_set: AtomicBool,
    parents: Vec<Arc<PhysicalTask>>,
    pending_parents: AtomicUsize,
    follower: Mutex<Option<Weak<PhysicalTask>>>,
    cost_state: Mutex<Option<CostState>>,
    executed_unit: Mutex<Option<StorageUnitId>>,
    remaining_backups: Mutex<VecDeque<StorageUnitId>>,
    result: Mutex<Option<TaskResult>>,
}

impl PhysicalTask {
    /// Build a task over `fragment`, touching `key_interval`.
    ///
    /// Errors when the operator list is empty.
    pub fn new(
        operators: Vec<Operator>,
        fragment: FragmentMeta,
        key_interval: KeyInterval,
    ) -> Result<Self> {
        if operators.is_empty() {
            return Err(PqError::InvalidConfig(
                "physical task requires at least one operator".to_string(),
            ));
        }
        Ok(Self {
            operators,
            fragment,
            key_interval,
            context_id: None,
            session_id: None,
            needs_broadcasting: false,
            is_sync: true,
            span_ms: AtomicU64::new(0),
            span_set: AtomicBool::new(false),
            parents: Vec::new(),
            pending_parents: AtomicUsize::new(0),
            follower: Mutex::new(None),
            cost_state: Mutex::new(None),
            executed_unit: Mutex::new(None),
            remaining_backups: Mutex::new(VecDeque::new()),
            result: Mutex::new(None),
        })
    }

    pub fn with_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_broadcasting(mut self, needs_broadcasting: bool) -> Self {
        self.needs_broadcasting = needs_broadcasting;
        self
    }

    pub fn with_sync(mut self, is_sync: bool) -> Self {
        self.is_sync = is_sync;
        self
    }

    /// Attach parent edges; the follower edge on each parent is set by the
    /// caller after wrapping this task in an `Arc`.
    pub fn with_parents(mut self, parents: Vec<Arc<PhysicalTask>>) -> Self {
        self.pending_parents = AtomicUsize::new(parents.len());
        self.parents = parents;
        self
    }

    /// Point every parent's follower edge at `child`.
    pub fn link_follower(child: &Arc<PhysicalTask>) {
        for parent in &child.parents {
            *parent.follower.lock() = Some(Arc::downgrade(child));
        }
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn fragment(&self) -> &FragmentMeta {
        &self.fragment
    }

    pub fn key_interval(&self) -> KeyInterval {
        self.key_interval
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context_id
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn needs_broadcasting(&self) -> bool {
        self.needs_broadcasting
    }

    pub fn is_sync(&self) -> bool {
        self.is_sync
    }

    pub fn parents(&self) -> &[Arc<PhysicalTask>] {
        &self.parents
    }

    pub fn follower(&self) -> Option<Arc<PhysicalTask>> {
        self.follower.lock().as_ref().and_then(Weak::upgrade)
    }

    /// True when the task reloads an already-persisted snapshot.
    pub fn is_checkpoint_load(&self) -> bool {
        matches!(self.operators.first(), Some(Operator::Load { .. }))
    }

    /// Checkpoint key for this task's output, when it carries a context.
    pub fn checkpoint_key(&self) -> Option<CheckpointKey> {
        let context_id = self.context_id?;
        let sequence = self.operators.first().map(Operator::sequence)?;
        Some(CheckpointKey::new(context_id, sequence))
    }

    /// Record wall-clock execution span. Set once; later calls are ignored.
    pub fn set_span_ms(&self, span_ms: u64) {
        if self
            .span_set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.span_ms.store(span_ms, Ordering::Release);
        }
    }

    pub fn span_ms(&self) -> u64 {
        self.span_ms.load(Ordering::Acquire)
    }

    /// One parent dependency satisfied; true once all parents are done.
    pub fn notify_parent_done(&self) -> bool {
        let before = self.pending_parents.fetch_sub(1, Ordering::AcqRel);
        before == 1
    }

    pub fn cost_state(&self) -> Option<CostState> {
        *self.cost_state.lock()
    }

    /// Finalize cost state. First writer wins; the decision is never revised.
    pub fn finalize_cost_state(&self, state: CostState) {
        let mut slot = self.cost_state.lock();
        if slot.is_none() {
            *slot = Some(state);
        }
    }

    /// Record which unit actually executed this task and stage the remaining
    /// units of the fragment as backup targets.
    pub fn mark_executed_on(&self, unit: &StorageUnitId) {
        *self.executed_unit.lock() = Some(unit.clone());
        let mut backups = self.remaining_backups.lock();
        backups.clear();
        backups.extend(
            self.fragment
                .all_units()
                .filter(|u| &u.id != unit)
                .map(|u| u.id.clone()),
        );
    }

    pub fn executed_unit(&self) -> Option<StorageUnitId> {
        self.executed_unit.lock().clone()
    }

    /// Rewind the range filter to resume strictly after `last_key` and hand
    /// out the next backup target, if any remain.
    ///
    /// The strict bound is the contract that keeps replay duplicate-free: a
    /// backup adapter honoring the filter cannot re-deliver the boundary row.
    pub fn back_up(&self, last_key: Option<i64>) -> Option<DataArea> {
        let unit = self.remaining_backups.lock().pop_front()?;
        let key_interval = match last_key {
            Some(k) => self.key_interval.resumed_after(k),
            None => self.key_interval,
        };
        *self.executed_unit.lock() = Some(unit.clone());
        Some(DataArea { unit, key_interval })
    }

    pub fn remaining_backup_count(&self) -> usize {
        self.remaining_backups.lock().len()
    }

    /// Store the execution result. Set once; a second write is a bug in the
    /// dispatch pipeline and is ignored.
    pub fn set_result(&self, result: TaskResult) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
    }

    pub fn take_result(&self) -> Option<TaskResult> {
        self.result.lock().take()
    }

    pub fn has_result(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Read-only broadcast copy of this task, targeted at one replica.
    ///
    /// Copies never re-broadcast and never chain followers; replica
    /// replication is eventual, not linearizable.
    pub fn broadcast_copy(&self) -> Result<PhysicalTask> {
        let task = PhysicalTask::new(
            self.operators.clone(),
            self.fragment.clone(),
            self.key_interval,
        )?;
        Ok(task.with_sync(false).with_broadcasting(false))
    }
}

impl std::fmt::Debug for PhysicalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalTask")
            .field("fragment", &self.fragment.id)
            .field("operators", &self.operators.len())
            .field("context_id", &self.context_id)
            .field("is_sync", &self.is_sync)
            .field("needs_broadcasting", &self.needs_broadcasting)
            .field("span_ms", &self.span_ms())
            .finish()
    }
}
