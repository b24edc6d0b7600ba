//! Data model and collaborator seams for the PQ execution core.
//!
//! Architecture role:
//! - defines [`task::PhysicalTask`] and [`task::TaskResult`], the unit of work
//!   the dispatcher schedules and the policy/repeater layers reason about;
//! - defines the row-stream model ([`row`]) that task results flow through;
//! - defines the external-collaborator contracts this core consumes:
//!   [`storage::StorageAdapter`], [`checkpoint::CheckpointStore`],
//!   [`metadata::MetadataHooks`].
//!
//! Everything behind these seams (SQL frontend, plan lowering, columnar
//! kernels, concrete engine drivers, metadata storage) lives outside this
//! workspace.

pub mod checkpoint;
pub mod fragment;
pub mod metadata;
pub mod operator;
pub mod row;
pub mod storage;
pub mod task;

pub use checkpoint::{CheckpointKey, CheckpointStore};
pub use fragment::{FragmentMeta, KeyInterval, StorageUnitMeta};
pub use metadata::MetadataHooks;
pub use operator::Operator;
pub use row::{BoxRowStream, DataType, Field, Header, MemTable, MemTableStream, Row, RowStream, Value};
pub use storage::{AdapterRegistry, EngineSpec, StorageAdapter, StorageEngineKind, StorageGateway};
pub use task::{CostState, DataArea, PhysicalTask, TaskResult};
