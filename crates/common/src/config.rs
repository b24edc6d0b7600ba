use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PqError;

/// Fault-tolerance (checkpoint) policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultTolerancePolicyKind {
    /// Coin-flip persistence under a size ceiling; no cost modeling.
    Default,
    /// Static threshold: persist only operators expensive relative to the
    /// configured tolerance budget.
    Naive,
    /// Cost-propagating greedy placement along the task DAG.
    Greedy,
}

impl FromStr for FaultTolerancePolicyKind {
    type Err = PqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "naive" => Ok(Self::Naive),
            "greedy" => Ok(Self::Greedy),
            other => Err(PqError::InvalidConfig(format!(
                "unknown fault tolerance policy '{other}', expected default|naive|greedy"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Engine-wide behavior/configuration knobs, passed explicitly to every
/// component at construction time.
pub struct EngineConfig {
    /// Enables the shared checkpoint store; [`persistence`] is a no-op when off.
    pub shared_storage_enabled: bool,
    /// Which checkpoint-decision strategy to use.
    pub fault_tolerance_policy: FaultTolerancePolicyKind,
    /// Row streams larger than this are never persisted (MB).
    pub fault_tolerance_max_persist_size_mb: u64,
    /// Fraction of total observed span an execution context may spend on
    /// checkpointing.
    pub max_cost_ratio: f64,
    /// Bounded task-level parallelism inside one storage unit.
    pub worker_pool_size_per_storage: usize,
    /// Backpressure ceiling: in-flight tasks beyond this are rejected.
    pub max_cached_tasks_per_storage: usize,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Per-echo timeout in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Echo attempts before a heartbeat round counts as failed.
    pub heartbeat_max_retry_times: u32,
    /// Probability of probing an already-blocked storage on one heartbeat tick.
    pub restore_heartbeat_probability: f64,
    /// Deadline for a connection vote round to reach quorum; a round still
    /// open past it is abandoned so the engine can be re-proposed.
    pub vote_round_timeout_ms: u64,
    /// First reconnection backoff in milliseconds.
    pub reconnect_initial_backoff_ms: u64,
    /// Reconnection backoff cap in milliseconds.
    pub reconnect_max_backoff_ms: u64,
    /// Multiplier applied to the backoff after each failed attempt.
    pub reconnect_backoff_multiplier: u32,
    /// Seed for the default policy's RNG, fixed so decisions replay in tests.
    pub default_policy_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shared_storage_enabled: false,
            fault_tolerance_policy: FaultTolerancePolicyKind::Default,
            fault_tolerance_max_persist_size_mb: 32,
            max_cost_ratio: 0.5,
            worker_pool_size_per_storage: 4,
            max_cached_tasks_per_storage: 16,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 50,
            heartbeat_max_retry_times: 3,
            restore_heartbeat_probability: 0.2,
            vote_round_timeout_ms: 10_000,
            reconnect_initial_backoff_ms: 2_000,
            reconnect_max_backoff_ms: 128_000,
            reconnect_backoff_multiplier: 2,
            default_policy_seed: 0x5151_u64,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config document; absent knobs keep their defaults.
    pub fn from_json_str(raw: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| PqError::InvalidConfig(format!("malformed engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Size ceiling in bytes, derived from the MB knob.
    pub fn max_persist_size_bytes(&self) -> u64 {
        self.fault_tolerance_max_persist_size_mb * 1024 * 1024
    }

    /// Validate knob ranges that cannot be expressed in the type system.
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker_pool_size_per_storage == 0 {
            return Err(PqError::InvalidConfig(
                "worker_pool_size_per_storage must be at least 1".to_string(),
            ));
        }
        if self.max_cached_tasks_per_storage == 0 {
            return Err(PqError::InvalidConfig(
                "max_cached_tasks_per_storage must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_cost_ratio) {
            return Err(PqError::InvalidConfig(format!(
                "max_cost_ratio must be within [0,1], got {}",
                self.max_cost_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.restore_heartbeat_probability) {
            return Err(PqError::InvalidConfig(format!(
                "restore_heartbeat_probability must be within [0,1], got {}",
                self.restore_heartbeat_probability
            )));
        }
        if self.vote_round_timeout_ms == 0 {
            return Err(PqError::InvalidConfig(
                "vote_round_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.reconnect_backoff_multiplier < 2 {
            return Err(PqError::InvalidConfig(
                "reconnect_backoff_multiplier must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
