//! Storage adapter contract and compile-time engine registry.
//!
//! Every adapter is treated as synchronous and potentially slow: the
//! dispatcher never assumes non-blocking behavior, and the liveness layer can
//! flip a gateway's `blocked` flag so workers fail fast instead of hanging on
//! a dead connector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use pq_common::{PqError, Result, StorageEngineId};
use serde::{Deserialize, Serialize};

use crate::fragment::KeyInterval;
use crate::operator::Operator;
use crate::row::Field;
use crate::task::{DataArea, TaskResult};

/// Engine families this core can route to. The concrete drivers live outside
/// this workspace; the kind only keys the constructor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngineKind {
    Relational,
    KeyValue,
    TimeSeries,
    Graph,
}

/// Connection description for one storage engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub id: StorageEngineId,
    pub kind: StorageEngineKind,
    /// Driver-specific parameters (host, port, credentials key, ...).
    pub params: HashMap<String, String>,
}

/// Contract every storage engine driver satisfies.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn execute_project(&self, op: &Operator, area: &DataArea) -> TaskResult;

    async fn execute_insert(&self, op: &Operator, area: &DataArea) -> TaskResult;

    async fn execute_delete(&self, op: &Operator, area: &DataArea) -> TaskResult;

    async fn get_columns(&self) -> Result<Vec<Field>>;

    async fn get_boundary_of_storage(&self) -> Result<KeyInterval>;

    /// Liveness probe used by heartbeats and vote-casting re-checks.
    async fn echo(&self, timeout: Duration) -> Result<()>;

    /// Release driver-held resources on shutdown or removal.
    async fn release(&self) -> Result<()>;
}

/// An adapter plus the liveness-controlled `blocked` flag.
///
/// The liveness protocol sets the flag on a confirmed connection loss;
/// dispatch workers check it and fail fast with [`PqError::Unavailable`].
pub struct StorageGateway {
    engine_id: StorageEngineId,
    adapter: Arc<dyn StorageAdapter>,
    blocked: AtomicBool,
}

impl StorageGateway {
    pub fn new(engine_id: StorageEngineId, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            engine_id,
            adapter,
            blocked: AtomicBool::new(false),
        }
    }

    pub fn engine_id(&self) -> StorageEngineId {
        self.engine_id
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }
}

impl std::fmt::Debug for StorageGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageGateway")
            .field("engine_id", &self.engine_id)
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

/// Constructor for one engine family.
pub type AdapterConstructor = fn(&EngineSpec) -> Result<Arc<dyn StorageAdapter>>;

/// Compile-time registry mapping engine kinds to adapter constructors.
///
/// Drivers register at process start; no dynamic code loading is involved.
#[derive(Default)]
pub struct AdapterRegistry {
    constructors: RwLock<HashMap<StorageEngineKind, AdapterConstructor>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; the last registration for a kind wins.
    pub fn register(&self, kind: StorageEngineKind, constructor: AdapterConstructor) {
        self.constructors.write().insert(kind, constructor);
    }

    pub fn build(&self, spec: &EngineSpec) -> Result<Arc<dyn StorageAdapter>> {
        let constructor = self
            .constructors
            .read()
            .get(&spec.kind)
            .copied()
            .ok_or_else(|| {
                PqError::InvalidConfig(format!(
                    "no adapter constructor registered for engine kind {:?}",
                    spec.kind
                ))
            })?;
        constructor(spec)
    }

    pub fn supports(&self, kind: StorageEngineKind) -> bool {
        self.constructors.read().contains_key(&kind)
    }
}
