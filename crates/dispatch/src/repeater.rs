//! Task repeater: drains a task's row stream and, on mid-stream failure,
//! replays the uncovered key range against the task's backup units, stitching
//! the partial tables back into one result.

use std::sync::Arc;

use async_trait::async_trait;
use pq_common::global_metrics;
use pq_model::row::{drain_stream_partial, MemTable};
use pq_model::{DataArea, PhysicalTask, TaskResult};
use tracing::{debug, warn};

use crate::dispatcher::StorageDispatcher;

/// Executes one operator replay against a specific data area, outside the
/// normal dispatch queue.
#[async_trait]
pub trait ReplayExecutor: Send + Sync {
    async fn replay(&self, task: &Arc<PhysicalTask>, area: &DataArea) -> TaskResult;
}

#[async_trait]
impl ReplayExecutor for StorageDispatcher {
    async fn replay(&self, task: &Arc<PhysicalTask>, area: &DataArea) -> TaskResult {
        self.execute_on_area(task, area).await
    }
}

/// Turns a possibly failing task result into a fully materialized one.
///
/// Rows already read before a failure are never dropped: each attempt's
/// partial table is kept and the next attempt resumes strictly after the last
/// key read, so the union reconstructs the full range. Whether the storage
/// honors the resume key exactly is up to the adapter; replicas that do not
/// may duplicate or skip rows at the retry boundary.
pub struct TaskRepeater {
    executor: Arc<dyn ReplayExecutor>,
}

impl TaskRepeater {
    pub fn new(executor: Arc<dyn ReplayExecutor>) -> Self {
        Self { executor }
    }

    /// Drain the result, replaying against backups until a clean drain or
    /// backup exhaustion.
    ///
    /// Returns the stitched table as a stream. Only when no row was ever read
    /// does a failure surface as the last error; with any rows in hand the
    /// union of partials is returned instead.
    pub async fn final_result(&self, task: &Arc<PhysicalTask>, first: TaskResult) -> TaskResult {
        let mut parts: Vec<MemTable> = Vec::new();
        let mut last_key: Option<i64> = None;
        let mut attempt = first;

        loop {
            let failure = match attempt.take_stream() {
                Some(mut stream) => {
                    let (part, err) = drain_stream_partial(stream.as_mut());
                    if part.last_key().is_some() {
                        last_key = part.last_key();
                    }
                    parts.push(part);
                    err
                }
                None => attempt.into_error(),
            };

            let err = match failure {
                None => break,
                Some(err) => err,
            };

            match task.back_up(last_key) {
                Some(area) => {
                    warn!(
                        unit = %area.unit,
                        resume_after = ?last_key,
                        error = %err,
                        "read failed; replaying on backup unit"
                    );
                    global_metrics().inc_repeater_replay(area.unit.as_str());
                    attempt = self.executor.replay(task, &area).await;
                }
                None => {
                    let rows_read: usize = parts.iter().map(MemTable::len).sum();
                    if rows_read == 0 {
                        return TaskResult::from_error(err);
                    }
                    warn!(rows_read, error = %err, "backups exhausted; returning partial union");
                    break;
                }
            }
        }

        let attempts = parts.len();
        match MemTable::union_in_order(parts) {
            Ok(table) => {
                if attempts > 1 {
                    debug!(attempts, rows = table.len(), "stitched partial read results");
                    if let Some(unit) = task.executed_unit() {
                        global_metrics().inc_repeater_rows_stitched(unit.as_str(), table.len() as u64);
                    }
                }
                TaskResult::from_stream(Box::new(table.into_stream()))
            }
            Err(err) => TaskResult::from_error(err),
        }
    }
}

#[cfg(test)]
#[path = "repeater_tests.rs"]
mod tests;
