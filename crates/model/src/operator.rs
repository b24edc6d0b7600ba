//! Physical operators carried by storage tasks.
//!
//! Only the storage-facing operator shapes live here; memory-side compute
//! kernels are an external collaborator. Each operator carries a plan-assigned
//! sequence number; a task's first sequence number keys its checkpoint.

use crate::checkpoint::CheckpointKey;
use crate::fragment::KeyInterval;
use crate::row::MemTable;

/// A storage-facing physical operator.
#[derive(Debug, Clone)]
pub enum Operator {
    /// Read matching series within the task's data area.
    Project {
        sequence: u64,
        patterns: Vec<String>,
    },
    /// Append rows to the target unit.
    Insert { sequence: u64, rows: MemTable },
    /// Delete matching series/ranges from the target unit.
    Delete {
        sequence: u64,
        patterns: Vec<String>,
        ranges: Vec<KeyInterval>,
    },
    /// Reload an already-persisted snapshot instead of recomputing.
    Load {
        sequence: u64,
        key: CheckpointKey,
    },
}

impl Operator {
    pub fn sequence(&self) -> u64 {
        match self {
            Operator::Project { sequence, .. }
            | Operator::Insert { sequence, .. }
            | Operator::Delete { sequence, .. }
            | Operator::Load { sequence, .. } => *sequence,
        }
    }

    /// Read-only operators are safe to replay against any replica.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Operator::Project { .. } | Operator::Load { .. })
    }

    /// True for writes that must be broadcast to keep replicas in sync.
    pub fn is_write(&self) -> bool {
        matches!(self, Operator::Insert { .. } | Operator::Delete { .. })
    }
}
