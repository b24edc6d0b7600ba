//! Shared configuration, error types, IDs, and observability primitives for PQ crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`PqError`] / [`Result`] contracts
//! - hosts the Prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::{EngineConfig, FaultTolerancePolicyKind};
pub use error::{PqError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
