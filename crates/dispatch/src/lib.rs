//! Per-storage-unit task dispatch.
//!
//! Responsibilities:
//! - serialize access to each storage unit behind one FIFO queue served by a
//!   dedicated dispatch loop, with cross-unit parallelism left unbounded;
//! - bound task-level parallelism inside one unit with a worker pool, and
//!   reject (never queue) work beyond the backlog ceiling;
//! - run the checkpoint policy's persistence hook on every completed task;
//! - notify follower tasks of satisfied dependencies and broadcast write
//!   tasks to replicas;
//! - replay failed reads against backup replicas and stitch partial results
//!   ([`repeater`]).
//!
//! Failure semantics: worker errors become failed task results, never
//! panics/rethrows into the dispatch loop; one failing task cannot stall a
//! queue.

pub mod dispatcher;
pub mod repeater;
pub mod session;

pub use dispatcher::{
    DispatcherDeps, MasterOnlySelector, ReplicaSelector, RoundRobinSelector, StorageDispatcher,
};
pub use repeater::{ReplayExecutor, TaskRepeater};
pub use session::SessionRegistry;
