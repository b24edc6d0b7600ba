//! Static-threshold persistence: checkpoint only operators that are
//! themselves expensive relative to the configured tolerance budget.

use std::sync::Arc;

use pq_model::{CheckpointStore, PhysicalTask};

use crate::DecisionStrategy;

pub struct NaivePolicy {
    max_persist_size_bytes: u64,
    max_cost_ratio: f64,
    store: Arc<dyn CheckpointStore>,
}

impl NaivePolicy {
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
}

impl DecisionStrategy for NaivePolicy {
    fn need_persistence(&self, task: &PhysicalTask, estimated_size_bytes: u64) -> bool {
        if estimated_size_bytes > self.max_persist_size_bytes {
            return false;
        }
        let persist_time_ms = self.store.estimate_persist_time_ms(estimated_size_bytes);
        task.span_ms() as f64 * self.max_cost_ratio > persist_time_ms
    }

    fn name(&self) -> &'static str {
        "naive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{dyn_store, project_task, RecordingStore};
    use async_trait::async_trait;
    use pq_common::Result;
    use pq_model::row::BoxRowStream;
    use pq_model::CheckpointKey;

    struct FixedEstimator {
        persist_ms: f64,
    }

    #[async_trait]
    impl CheckpointStore for FixedEstimator {
        async fn store(&self, _key: CheckpointKey, _stream: BoxRowStream) -> Result<bool> {
            Ok(true)
        }

        async fn load(&self, _key: CheckpointKey) -> Result<BoxRowStream> {
            Err(pq_common::PqError::Unsupported("not scripted".to_string()))
        }

        fn estimate_persist_time_ms(&self, _bytes: u64) -> f64 {
            self.persist_ms
        }

        fn estimate_load_time_ms(&self, _bytes: u64) -> f64 {
            self.persist_ms
        }
    }

    #[test]
    fn persists_when_span_budget_covers_persist_time() {
        // span=100ms, ratio=0.5 => budget 50ms; persist estimated at 40ms.
        let policy = NaivePolicy::new(
            u64::MAX,
            0.5,
            Arc::new(FixedEstimator { persist_ms: 40.0 }),
        );
        let task = project_task(100);
        assert!(policy.need_persistence(&task, 1024));
    }

    #[test]
    fn skips_when_persist_time_exceeds_budget() {
        let policy = NaivePolicy::new(
            u64::MAX,
            0.5,
            Arc::new(FixedEstimator { persist_ms: 60.0 }),
        );
        let task = project_task(100);
        assert!(!policy.need_persistence(&task, 1024));
    }

    #[test]
    fn size_ceiling_applies_before_the_threshold() {
        let store = Arc::new(RecordingStore::new(0.0, 0.0));
        let policy = NaivePolicy::new(1024, 0.5, dyn_store(&store));
        let task = project_task(10_000);
        assert!(!policy.need_persistence(&task, 4096));
    }
}
