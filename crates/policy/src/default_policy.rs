//! Coin-flip persistence under a size ceiling.
//!
//! Used when span/size telemetry is unreliable: no cost modeling, just a
//! fixed persist probability. The RNG is seeded so decisions replay
//! deterministically in tests.

use parking_lot::Mutex;
use pq_model::PhysicalTask;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::DecisionStrategy;

const PERSIST_PROBABILITY: f64 = 0.5;

pub struct DefaultPolicy {
    max_persist_size_bytes: u64,
    rng: Mutex<StdRng>,
}

impl DefaultPolicy {
    pub fn new(max_persist_size_bytes: u64, seed: u64) -> Self {
        Self {
            max_persist_size_bytes,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl DecisionStrategy for DefaultPolicy {
    fn need_persistence(&self, _task: &PhysicalTask, estimated_size_bytes: u64) -> bool {
        if estimated_size_bytes > self.max_persist_size_bytes {
            return false;
        }
        self.rng.lock().gen_bool(PERSIST_PROBABILITY)
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{project_task, rows_result};

    #[test]
    fn oversize_output_is_never_persisted() {
        // faultToleranceMaxPersistSize = 1 MB, stream estimated at 2 MiB.
        let policy = DefaultPolicy::new(1024 * 1024, 42);
        let task = project_task(100);
        for _ in 0..64 {
            assert!(!policy.need_persistence(&task, 2 * 1024 * 1024));
        }
    }

    #[test]
    fn same_seed_replays_the_same_decisions() {
        let task = project_task(100);
        let result = rows_result(4);
        let a = DefaultPolicy::new(u64::MAX, 7);
        let b = DefaultPolicy::new(u64::MAX, 7);
        let decisions_a: Vec<bool> = (0..32)
            .map(|_| a.need_persistence(&task, result.estimated_size_bytes()))
            .collect();
        let decisions_b: Vec<bool> = (0..32)
            .map(|_| b.need_persistence(&task, result.estimated_size_bytes()))
            .collect();
        assert_eq!(decisions_a, decisions_b);
        assert!(decisions_a.iter().any(|d| *d));
        assert!(decisions_a.iter().any(|d| !*d));
    }
}
