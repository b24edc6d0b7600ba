//! Budget-constrained greedy checkpoint placement along the task DAG.
//!
//! Each task carries a [`CostState`] finalized exactly once, at decision
//! time. Children read parents' finalized states only; the dispatcher
//! processes the DAG in dependency order, so no stale reads occur.
//!
//! Decision, in order:
//! 1. never persist a checkpoint-load task or oversize output;
//! 2. never persist a subtree that is cheaper to recompute than to reload;
//! 3. otherwise persist iff the checkpoint budget, a fixed fraction of the
//!    context's total observed span, has not yet been exhausted by this and
//!    prior persisted ancestors (ties persist).
//!
//! This is a local greedy heuristic made cost-aware by amortizing a spend
//! budget along each path from the root, not a globally optimal placement.

use std::sync::Arc;

use pq_model::{CheckpointStore, CostState, PhysicalTask};
use tracing::debug;

use crate::DecisionStrategy;

pub struct GreedyPolicy {
    max_persist_size_bytes: u64,
    max_cost_ratio: f64,
    store: Arc<dyn CheckpointStore>,
}

impl GreedyPolicy {
    pub fn new(
        max_persist_size_bytes: u64,
        max_cost_ratio: f64,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            max_persist_size_bytes,
            max_cost_ratio,
            store,
        }
    }

    /// Aggregate finalized parent states. Missing states (parents outside the
    /// checkpointing context) contribute nothing.
    fn inherited(task: &PhysicalTask) -> (f64, f64, f64) {
        let mut span = 0.0;
        let mut redo = 0.0;
        let mut persist = 0.0;
        for parent in task.parents() {
            if let Some(state) = parent.cost_state() {
                span += state.total_span_ms;
                redo += state.redo_cost_ms;
                persist += state.total_persist_time_ms;
            }
        }
        (span, redo, persist)
    }
}

impl DecisionStrategy for GreedyPolicy {
    fn need_persistence(&self, task: &PhysicalTask, estimated_size_bytes: u64) -> bool {
        let span_ms = task.span_ms() as f64;
        let (parent_span, parent_redo, parent_persist) = Self::inherited(task);
        let total_span_ms = span_ms + parent_span;
        let redo_without = span_ms + parent_redo;
        let persist_time_ms = self.store.estimate_persist_time_ms(estimated_size_bytes);
        let load_time_ms = self.store.estimate_load_time_ms(estimated_size_bytes);

        let mut state = CostState {
            total_span_ms,
            estimated_size_bytes,
            persist_time_ms,
            load_time_ms,
            redo_cost_ms: redo_without,
            redo_cost_without_persist_ms: redo_without,
            total_persist_time_ms: parent_persist,
        };

        // Loads of already-persisted data and oversize outputs are never
        // re-persisted.
        if task.is_checkpoint_load() || estimated_size_bytes > self.max_persist_size_bytes {
            task.finalize_cost_state(state);
            return false;
        }

        // Recomputing the subtree beats ever reloading a checkpoint of it.
        if redo_without < load_time_ms {
            task.finalize_cost_state(state);
            return false;
        }

        // Budget check; ties favor persisting.
        let budget_ms = total_span_ms * self.max_cost_ratio;
        let spend_ms = parent_persist + persist_time_ms;
        let persist = budget_ms >= spend_ms;
        if persist {
            state.redo_cost_ms = load_time_ms;
            state.total_persist_time_ms = parent_persist + persist_time_ms;
        }
        task.finalize_cost_state(state);
        debug!(
            persist,
            total_span_ms,
            budget_ms,
            spend_ms,
            redo_without,
            load_time_ms,
            "greedy checkpoint decision"
        );
        persist
    }

    fn name(&self) -> &'static str {
        "greedy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{dyn_store, single_unit_fragment, RecordingStore};
    use pq_common::ContextId;
    use pq_model::{KeyInterval, Operator, PhysicalTask};

    const MB: u64 = 1024 * 1024;

    fn task_with_parents(span_ms: u64, parents: Vec<Arc<PhysicalTask>>) -> Arc<PhysicalTask> {
        let task = PhysicalTask::new(
            vec![Operator::Project {
                sequence: 0,
                patterns: vec!["s.*".to_string()],
            }],
            single_unit_fragment(),
            KeyInterval::new(0, 1000),
        )
        .unwrap()
        .with_context(ContextId(9))
        .with_parents(parents);
        task.set_span_ms(span_ms);
        Arc::new(task)
    }

    fn load_task(span_ms: u64) -> Arc<PhysicalTask> {
        let task = PhysicalTask::new(
            vec![Operator::Load {
                sequence: 0,
                key: pq_model::CheckpointKey::new(ContextId(9), 0),
            }],
            single_unit_fragment(),
            KeyInterval::new(0, 1000),
        )
        .unwrap()
        .with_context(ContextId(9));
        task.set_span_ms(span_ms);
        Arc::new(task)
    }

    #[test]
    fn oversize_output_is_skipped_regardless_of_costs() {
        let store = Arc::new(RecordingStore::new(0.001, 0.001));
        let policy = GreedyPolicy::new(MB, 0.9, dyn_store(&store));
        let task = task_with_parents(1_000_000, Vec::new());
        assert!(!policy.need_persistence(&task, 2 * MB));
        // Cost state is still finalized so children can read it.
        let state = task.cost_state().unwrap();
        assert_eq!(state.redo_cost_ms, state.redo_cost_without_persist_ms);
    }

    #[test]
    fn checkpoint_load_tasks_are_never_re_persisted() {
        let store = Arc::new(RecordingStore::new(0.001, 0.001));
        let policy = GreedyPolicy::new(u64::MAX, 0.9, dyn_store(&store));
        let task = load_task(10_000);
        assert!(!policy.need_persistence(&task, 1024));
    }

    #[test]
    fn cheap_recompute_beats_reload() {
        // 1ms of recompute vs an expensive load: persisting buys nothing.
        let store = Arc::new(RecordingStore::new(100.0, 100.0));
        let policy = GreedyPolicy::new(u64::MAX, 0.9, dyn_store(&store));
        let task = task_with_parents(1, Vec::new());
        assert!(!policy.need_persistence(&task, MB));
        assert_eq!(task.cost_state().unwrap().redo_cost_ms, 1.0);
    }

    #[test]
    fn persisting_replaces_redo_cost_with_load_time() {
        // persist 10ms/MB, load 5ms/MB, span 100ms, ratio 0.5 => budget 50ms.
        let store = Arc::new(RecordingStore::new(10.0, 5.0));
        let policy = GreedyPolicy::new(u64::MAX, 0.5, dyn_store(&store));
        let task = task_with_parents(100, Vec::new());
        assert!(policy.need_persistence(&task, MB));
        let state = task.cost_state().unwrap();
        assert_eq!(state.redo_cost_ms, 5.0);
        assert_eq!(state.total_persist_time_ms, 10.0);
        assert_eq!(state.redo_cost_without_persist_ms, 100.0);
    }

    #[test]
    fn exact_budget_tie_still_persists() {
        // span 100ms, ratio 0.1 => budget 10ms == persist time 10ms.
        let store = Arc::new(RecordingStore::new(10.0, 5.0));
        let policy = GreedyPolicy::new(u64::MAX, 0.1, dyn_store(&store));
        let task = task_with_parents(100, Vec::new());
        assert!(policy.need_persistence(&task, MB));
    }

    #[test]
    fn exhausted_budget_stops_persisting_down_the_chain() {
        // Each level: span 100ms, persist 30ms/MB on 1MB outputs, ratio 0.5.
        // Budgets along the chain: 50, 100, 150... spends: 30, 60, 90... so
        // every level persists until the budget line is crossed by a level
        // with a smaller span.
        let store = Arc::new(RecordingStore::new(30.0, 5.0));
        let policy = GreedyPolicy::new(u64::MAX, 0.5, dyn_store(&store));

        let root = task_with_parents(100, Vec::new());
        assert!(policy.need_persistence(&root, MB));

        let mid = task_with_parents(100, vec![Arc::clone(&root)]);
        assert!(policy.need_persistence(&mid, MB));

        // Child adds barely any span: budget (205*0.5=102.5) < spend (90).
        // Still fits. One more persist would need 120 <= 103-ish: rejected.
        let leaf = task_with_parents(5, vec![Arc::clone(&mid)]);
        assert!(policy.need_persistence(&leaf, MB));

        let tail = task_with_parents(1, vec![Arc::clone(&leaf)]);
        assert!(!policy.need_persistence(&tail, MB));
        let state = tail.cost_state().unwrap();
        assert_eq!(state.total_persist_time_ms, 90.0);
    }

    #[test]
    fn persist_spend_never_exceeds_budget_by_more_than_one_step() {
        // Random-ish chain; verify the one-step-ahead overshoot bound at
        // every level.
        let store = Arc::new(RecordingStore::new(25.0, 5.0));
        let policy = GreedyPolicy::new(u64::MAX, 0.4, dyn_store(&store));
        let spans = [80_u64, 10, 250, 5, 40, 120, 3, 60];

        let mut prev: Option<Arc<PhysicalTask>> = None;
        for span in spans {
            let parents = prev.iter().cloned().collect();
            let task = task_with_parents(span, parents);
            policy.need_persistence(&task, MB);
            let state = task.cost_state().unwrap();
            let budget = state.total_span_ms * 0.4;
            let one_step = store.estimate_persist_time_ms(MB);
            assert!(
                state.total_persist_time_ms <= budget + one_step,
                "spend {} exceeded budget {} + step {}",
                state.total_persist_time_ms,
                budget,
                one_step
            );
            prev = Some(task);
        }
    }

    #[test]
    fn parent_states_propagate_through_joins() {
        let store = Arc::new(RecordingStore::new(10.0, 5.0));
        let policy = GreedyPolicy::new(u64::MAX, 0.5, dyn_store(&store));

        let left = task_with_parents(50, Vec::new());
        let right = task_with_parents(70, Vec::new());
        policy.need_persistence(&left, MB);
        policy.need_persistence(&right, MB);

        let join = task_with_parents(30, vec![Arc::clone(&left), Arc::clone(&right)]);
        policy.need_persistence(&join, MB);
        let state = join.cost_state().unwrap();
        assert_eq!(state.total_span_ms, 150.0);
    }
}
