//! Fragments and storage units.
//!
//! A fragment is a contiguous key-range partition of the logical dataset,
//! mapped to exactly one master storage unit plus zero-or-more replicas.
//! Replicas are kept in sync by task broadcast, not log shipping.

use pq_common::{FragmentId, StorageEngineId, StorageUnitId};
use serde::{Deserialize, Serialize};

/// Half-open key interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyInterval {
    pub start: i64,
    pub end: i64,
}

impl KeyInterval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Unbounded interval covering every key.
    pub fn full() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    pub fn contains(&self, key: i64) -> bool {
        key >= self.start && key < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Resume interval strictly after `last_key`, used by backup replay.
    pub fn resumed_after(&self, last_key: i64) -> Self {
        Self {
            start: last_key.saturating_add(1).max(self.start),
            end: self.end,
        }
    }
}

/// One physical replica instance of a fragment on a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnitMeta {
    pub id: StorageUnitId,
    pub storage_engine: StorageEngineId,
    pub is_master: bool,
}

/// A fragment's placement: one master unit plus its replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub id: FragmentId,
    pub key_interval: KeyInterval,
    pub master_unit: StorageUnitMeta,
    pub replica_units: Vec<StorageUnitMeta>,
}

impl FragmentMeta {
    /// All units hosting this fragment, master first.
    pub fn all_units(&self) -> impl Iterator<Item = &StorageUnitMeta> {
        std::iter::once(&self.master_unit).chain(self.replica_units.iter())
    }

    pub fn unit(&self, id: &StorageUnitId) -> Option<&StorageUnitMeta> {
        self.all_units().find(|u| &u.id == id)
    }
}
