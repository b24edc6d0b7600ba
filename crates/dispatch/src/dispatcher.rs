//! Storage dispatcher: one FIFO queue + dispatch loop per storage unit,
//! bounded worker pools, replica broadcast, and the persistence hook.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use pq_common::{global_metrics, EngineConfig, PqError, Result, StorageEngineId, StorageUnitId};
use pq_model::{
    AdapterRegistry, CheckpointStore, DataArea, EngineSpec, FragmentMeta, MetadataHooks, Operator,
    PhysicalTask, StorageGateway, StorageUnitMeta, TaskResult,
};
use pq_policy::PersistencePolicy;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::repeater::{ReplayExecutor, TaskRepeater};
use crate::session::SessionRegistry;

/// Chooses which unit of a fragment serves a read task.
///
/// Write tasks always route to the master; replicas are kept in sync by
/// broadcast afterward.
pub trait ReplicaSelector: Send + Sync {
    fn select(&self, fragment: &FragmentMeta) -> StorageUnitId;
}

/// Default routing: always the master unit.
#[derive(Debug, Default)]
pub struct MasterOnlySelector;

impl ReplicaSelector for MasterOnlySelector {
    fn select(&self, fragment: &FragmentMeta) -> StorageUnitId {
        fragment.master_unit.id.clone()
    }
}

/// Spreads reads across master and replicas in rotation.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl ReplicaSelector for RoundRobinSelector {
    fn select(&self, fragment: &FragmentMeta) -> StorageUnitId {
        let n = 1 + fragment.replica_units.len();
        let pick = self.counter.fetch_add(1, Ordering::Relaxed) % n;
        fragment
            .all_units()
            .nth(pick)
            .map(|u| u.id.clone())
            .unwrap_or_else(|| fragment.master_unit.id.clone())
    }
}

/// Collaborators injected into the dispatcher at construction time.
pub struct DispatcherDeps {
    pub policy: Arc<PersistencePolicy>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub sessions: Arc<SessionRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub selector: Box<dyn ReplicaSelector>,
}

struct UnitRuntime {
    tx: UnboundedSender<Arc<PhysicalTask>>,
    inflight: Arc<AtomicUsize>,
    pool: Arc<Semaphore>,
    loop_handle: JoinHandle<()>,
}

pub(crate) struct DispatcherInner {
    config: EngineConfig,
    units: RwLock<HashMap<StorageUnitId, UnitRuntime>>,
    unit_meta: RwLock<HashMap<StorageUnitId, StorageUnitMeta>>,
    gateways: RwLock<HashMap<StorageEngineId, Arc<StorageGateway>>>,
    policy: Arc<PersistencePolicy>,
    checkpoints: Arc<dyn CheckpointStore>,
    sessions: Arc<SessionRegistry>,
    adapters: Arc<AdapterRegistry>,
    selector: Box<dyn ReplicaSelector>,
    runtime: tokio::runtime::Handle,
}

/// Owns one dispatch loop and one bounded worker pool per storage unit.
#[derive(Clone)]
pub struct StorageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl StorageDispatcher {
    /// Must be called from within a tokio runtime; dispatch loops and workers
    /// are spawned onto it.
    pub fn new(config: EngineConfig, deps: DispatcherDeps) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                config,
                units: RwLock::new(HashMap::new()),
                unit_meta: RwLock::new(HashMap::new()),
                gateways: RwLock::new(HashMap::new()),
                policy: deps.policy,
                checkpoints: deps.checkpoints,
                sessions: deps.sessions,
                adapters: deps.adapters,
                selector: deps.selector,
                runtime: tokio::runtime::Handle::current(),
            }),
        })
    }

    /// Register the gateway for one storage engine.
    pub fn register_gateway(&self, gateway: Arc<StorageGateway>) {
        self.inner
            .gateways
            .write()
            .insert(gateway.engine_id(), gateway);
    }

    pub fn gateway(&self, engine: StorageEngineId) -> Option<Arc<StorageGateway>> {
        self.inner.gateways.read().get(&engine).cloned()
    }

    /// Create the queue and dispatch loop for a new storage unit.
    ///
    /// Idempotent: re-registering an existing unit is a no-op.
    pub fn register_storage_unit(&self, meta: StorageUnitMeta) {
        let unit = meta.id.clone();
        {
            let units = self.inner.units.read();
            if units.contains_key(&unit) {
                return;
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let inflight = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(Semaphore::new(self.inner.config.worker_pool_size_per_storage));
        let loop_handle = self.inner.runtime.spawn(run_unit_loop(
            Arc::clone(&self.inner),
            unit.clone(),
            rx,
            Arc::clone(&inflight),
            Arc::clone(&pool),
        ));
        self.inner.unit_meta.write().insert(unit.clone(), meta);
        let mut units = self.inner.units.write();
        units.entry(unit.clone()).or_insert(UnitRuntime {
            tx,
            inflight,
            pool,
            loop_handle,
        });
        info!(unit = %unit, "registered storage unit dispatch queue");
    }

    /// Route a task to a storage unit's queue.
    ///
    /// Routing failures are logged and the task is failed asynchronously; the
    /// caller observes them through the task's result, never as an error here.
    pub fn submit(&self, task: Arc<PhysicalTask>) {
        submit_task(&self.inner, task);
    }

    /// Number of tasks currently in flight for one unit (test/inspection).
    pub fn inflight(&self, unit: &StorageUnitId) -> usize {
        self.inner
            .units
            .read()
            .get(unit)
            .map(|u| u.inflight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Execute a task's operator directly against one data area, bypassing the
    /// queue. Used by the repeater to replay onto backup units.
    pub(crate) async fn execute_on_area(
        &self,
        task: &Arc<PhysicalTask>,
        area: &DataArea,
    ) -> TaskResult {
        let gateway = {
            let meta = self.inner.unit_meta.read().get(&area.unit).cloned();
            meta.and_then(|m| self.inner.gateways.read().get(&m.storage_engine).cloned())
        };
        match gateway {
            Some(g) if !g.is_blocked() => execute_task(&self.inner, g.as_ref(), task, area).await,
            Some(g) => TaskResult::from_error(PqError::Unavailable(format!(
                "storage engine {} is blocked by the liveness protocol",
                g.engine_id()
            ))),
            None => TaskResult::from_error(PqError::Unavailable(format!(
                "no gateway registered for unit {}",
                area.unit
            ))),
        }
    }

    /// Stop every dispatch loop, wait for in-flight workers to finish, then
    /// release every gateway adapter.
    pub async fn shutdown(&self) {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut pools: Vec<Arc<Semaphore>> = Vec::new();
        {
            let mut units = self.inner.units.write();
            for (_, runtime) in units.drain() {
                drop(runtime.tx);
                handles.push(runtime.loop_handle);
                pools.push(runtime.pool);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        // Every worker holds one pool permit for its whole run, so draining a
        // unit means reclaiming its full permit count.
        let pool_size = self.inner.config.worker_pool_size_per_storage as u32;
        for pool in pools {
            let _drained = pool.acquire_many(pool_size).await;
        }
        let gateways: Vec<Arc<StorageGateway>> =
            self.inner.gateways.write().drain().map(|(_, g)| g).collect();
        for gateway in gateways {
            if let Err(err) = gateway.adapter().release().await {
                warn!(engine = %gateway.engine_id(), error = %err, "adapter release failed");
            }
        }
    }
}

impl MetadataHooks for StorageDispatcher {
    fn on_storage_unit_created(&self, _before: Option<&StorageUnitMeta>, after: &StorageUnitMeta) {
        self.register_storage_unit(after.clone());
    }

    fn on_storage_engine_changed(&self, _before: Option<&EngineSpec>, after: &EngineSpec) {
        match self.inner.adapters.build(after) {
            Ok(adapter) => {
                let gateway = Arc::new(StorageGateway::new(after.id, adapter));
                let old = self.inner.gateways.write().insert(after.id, gateway);
                if let Some(old) = old {
                    self.inner.runtime.spawn(async move {
                        if let Err(err) = old.adapter().release().await {
                            warn!(engine = %old.engine_id(), error = %err, "stale adapter release failed");
                        }
                    });
                }
                info!(engine = %after.id, "storage engine gateway refreshed");
            }
            Err(err) => {
                error!(engine = %after.id, error = %err, "failed to build adapter for changed engine");
            }
        }
    }
}

fn submit_task(inner: &Arc<DispatcherInner>, task: Arc<PhysicalTask>) {
    let unit = inner.selector.select(task.fragment());
    submit_task_to_unit(inner, task, unit);
}

fn submit_task_to_unit(inner: &Arc<DispatcherInner>, task: Arc<PhysicalTask>, unit: StorageUnitId) {
    task.mark_executed_on(&unit);
    global_metrics().inc_submitted(unit.as_str());
    let sent = {
        let units = inner.units.read();
        match units.get(&unit) {
            Some(runtime) => runtime.tx.send(Arc::clone(&task)).is_ok(),
            None => false,
        }
    };
    if !sent {
        error!(unit = %unit, task = ?task, "no dispatch queue for storage unit");
        fail_task(
            inner,
            &unit,
            task,
            PqError::Unavailable(format!("no dispatch queue for storage unit {unit}")),
        );
    }
}

/// Turn a task into a failed result without touching the dispatch loop.
fn fail_task(
    inner: &Arc<DispatcherInner>,
    unit: &StorageUnitId,
    task: Arc<PhysicalTask>,
    err: PqError,
) {
    warn!(unit = %unit, error = %err, "task failed before execution");
    task.set_result(TaskResult::from_error(err));
    global_metrics().inc_failed(unit.as_str());
    notify_follower(inner, &task);
}

/// On completion, count one satisfied dependency on the follower and schedule
/// it once every parent is done. Only synchronously executed tasks chain.
fn notify_follower(inner: &Arc<DispatcherInner>, task: &Arc<PhysicalTask>) {
    if !task.is_sync() {
        return;
    }
    if let Some(follower) = task.follower() {
        if follower.notify_parent_done() {
            debug!(follower = ?follower, "all dependencies satisfied; scheduling follower");
            submit_task(inner, follower);
        }
    }
}

async fn run_unit_loop(
    inner: Arc<DispatcherInner>,
    unit: StorageUnitId,
    mut rx: UnboundedReceiver<Arc<PhysicalTask>>,
    inflight: Arc<AtomicUsize>,
    pool: Arc<Semaphore>,
) {
    // Accepted tasks wait here for a pool permit. Permits are taken in
    // backlog order by this loop, never raced for by workers, so same-unit
    // tasks start execution strictly in submission order.
    let mut backlog: VecDeque<(Arc<PhysicalTask>, Arc<StorageGateway>)> = VecDeque::new();
    let mut open = true;
    while open || !backlog.is_empty() {
        tokio::select! {
            maybe = rx.recv(), if open => {
                let Some(task) = maybe else {
                    open = false;
                    continue;
                };

                // (a) Backpressure: beyond the ceiling, reject instead of queueing.
                let pending = inflight.load(Ordering::Acquire);
                if pending >= inner.config.max_cached_tasks_per_storage {
                    global_metrics().inc_rejected_overload(unit.as_str());
                    fail_task(
                        &inner,
                        &unit,
                        task,
                        PqError::Overloaded {
                            unit: unit.to_string(),
                            pending,
                        },
                    );
                    continue;
                }

                // (b) Cooperative cancellation, checked only at queue-pop time.
                if let Some(session) = task.session_id() {
                    if inner.sessions.is_closed(session) {
                        debug!(unit = %unit, session = %session, "dropping task for closed session");
                        global_metrics().inc_dropped_canceled(unit.as_str());
                        continue;
                    }
                }

                let gateway = {
                    let meta = inner.unit_meta.read().get(&unit).cloned();
                    meta.and_then(|m| inner.gateways.read().get(&m.storage_engine).cloned())
                };
                let gateway = match gateway {
                    Some(g) if !g.is_blocked() => g,
                    Some(g) => {
                        fail_task(
                            &inner,
                            &unit,
                            task,
                            PqError::Unavailable(format!(
                                "storage engine {} is blocked by the liveness protocol",
                                g.engine_id()
                            )),
                        );
                        continue;
                    }
                    None => {
                        fail_task(
                            &inner,
                            &unit,
                            task,
                            PqError::Unavailable(format!("no gateway registered for unit {unit}")),
                        );
                        continue;
                    }
                };

                inflight.fetch_add(1, Ordering::AcqRel);
                global_metrics()
                    .set_inflight_tasks(unit.as_str(), inflight.load(Ordering::Acquire) as u64);
                backlog.push_back((task, gateway));
            }
            permit = Arc::clone(&pool).acquire_owned(), if !backlog.is_empty() => {
                let Ok(permit) = permit else { break };
                if let Some((task, gateway)) = backlog.pop_front() {
                    inner.runtime.spawn(run_worker(
                        Arc::clone(&inner),
                        unit.clone(),
                        task,
                        gateway,
                        permit,
                        Arc::clone(&inflight),
                    ));
                }
            }
        }
    }
    debug!(unit = %unit, "dispatch loop stopped");
}

async fn run_worker(
    inner: Arc<DispatcherInner>,
    unit: StorageUnitId,
    task: Arc<PhysicalTask>,
    gateway: Arc<StorageGateway>,
    permit: OwnedSemaphorePermit,
    inflight: Arc<AtomicUsize>,
) {
    let area = DataArea {
        unit: unit.clone(),
        key_interval: task.key_interval(),
    };
    let start = Instant::now();
    let mut result = execute_task(&inner, gateway.as_ref(), &task, &area).await;
    let span_ms = start.elapsed().as_millis() as u64;
    task.set_span_ms(span_ms);
    global_metrics().observe_task_span(unit.as_str(), span_ms as f64 / 1000.0);

    inner.policy.persistence(&task, &mut result).await;

    // Reads pass through the repeater so a failed or truncated result is
    // replayed onto the task's backup units before anyone observes it.
    // Checkpoint loads read the shared store, which has no backup to replay.
    if !task.is_checkpoint_load() && task.operators().iter().all(Operator::is_read_only) {
        let dispatcher = StorageDispatcher {
            inner: Arc::clone(&inner),
        };
        let repeater = TaskRepeater::new(Arc::new(dispatcher) as Arc<dyn ReplayExecutor>);
        result = repeater.final_result(&task, result).await;
    }

    let succeeded = result.is_ok();
    if succeeded {
        global_metrics().inc_succeeded(unit.as_str());
    } else {
        warn!(unit = %unit, error = ?result.error(), "task execution failed");
        global_metrics().inc_failed(unit.as_str());
    }
    task.set_result(result);

    notify_follower(&inner, &task);

    if task.needs_broadcasting() && succeeded {
        broadcast_to_replicas(&inner, &task, &unit);
    }

    drop(permit);
    inflight.fetch_sub(1, Ordering::AcqRel);
    global_metrics().set_inflight_tasks(unit.as_str(), inflight.load(Ordering::Acquire) as u64);
}

/// Execute the task's storage operator. Adapter failures surface as failed
/// results; nothing is rethrown to the dispatch loop.
async fn execute_task(
    inner: &Arc<DispatcherInner>,
    gateway: &StorageGateway,
    task: &Arc<PhysicalTask>,
    area: &DataArea,
) -> TaskResult {
    let op = &task.operators()[0];
    match op {
        Operator::Project { .. } => gateway.adapter().execute_project(op, area).await,
        Operator::Insert { .. } => gateway.adapter().execute_insert(op, area).await,
        Operator::Delete { .. } => gateway.adapter().execute_delete(op, area).await,
        Operator::Load { key, .. } => match inner.checkpoints.load(*key).await {
            Ok(stream) => TaskResult::from_stream(stream),
            Err(err) => TaskResult::from_error(err),
        },
    }
}

/// Enqueue read-only copies of a broadcast task to every replica other than
/// the unit that served the primary. Copies are eventual, not ordered
/// relative to later primary writes.
fn broadcast_to_replicas(inner: &Arc<DispatcherInner>, task: &Arc<PhysicalTask>, executed: &StorageUnitId) {
    let mut copies = 0_u64;
    for replica in task.fragment().all_units() {
        if &replica.id == executed {
            continue;
        }
        match task.broadcast_copy() {
            Ok(copy) => {
                submit_task_to_unit(inner, Arc::new(copy), replica.id.clone());
                copies += 1;
            }
            Err(err) => {
                error!(unit = %replica.id, error = %err, "failed to build broadcast copy");
            }
        }
    }
    if copies > 0 {
        debug!(unit = %executed, copies, "broadcast write task to replicas");
        global_metrics().inc_broadcast_copies(executed.as_str(), copies);
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
