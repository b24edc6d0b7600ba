use super::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use pq_common::{ContextId, FragmentId, SessionId};
use pq_model::row::{BoxRowStream, DataType, Field, Header, MemTable, Row, Value};
use pq_model::{CheckpointKey, KeyInterval, StorageAdapter};
use pq_policy::DecisionStrategy;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

struct NoPersist;

impl DecisionStrategy for NoPersist {
    fn need_persistence(&self, _task: &PhysicalTask, _size: u64) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "never"
    }
}

struct NullCheckpointStore;

#[async_trait]
impl CheckpointStore for NullCheckpointStore {
    async fn store(&self, _key: CheckpointKey, _stream: BoxRowStream) -> pq_common::Result<bool> {
        Ok(true)
    }

    async fn load(&self, key: CheckpointKey) -> pq_common::Result<BoxRowStream> {
        Err(PqError::Unavailable(format!("no checkpoint for {key}")))
    }

    fn estimate_persist_time_ms(&self, _bytes: u64) -> f64 {
        0.0
    }

    fn estimate_load_time_ms(&self, _bytes: u64) -> f64 {
        0.0
    }
}

/// Records executions per unit; optionally gates every execution on a shared
/// semaphore and fails configured units.
struct MockAdapter {
    executions: Arc<Mutex<Vec<(StorageUnitId, String)>>>,
    gate: Option<Arc<Semaphore>>,
    failing_patterns: HashSet<String>,
    failing_units: HashSet<String>,
    released: Arc<AtomicBool>,
}

impl MockAdapter {
    fn new(executions: Arc<Mutex<Vec<(StorageUnitId, String)>>>) -> Self {
        Self {
            executions,
            gate: None,
            failing_patterns: HashSet::new(),
            failing_units: HashSet::new(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn failing(mut self, pattern: &str) -> Self {
        self.failing_patterns.insert(pattern.to_string());
        self
    }

    fn failing_on_unit(mut self, unit: &str) -> Self {
        self.failing_units.insert(unit.to_string());
        self
    }

    fn release_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.released = flag;
        self
    }

    async fn run(&self, label: String, area: &DataArea) -> TaskResult {
        self.executions.lock().push((area.unit.clone(), label.clone()));
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        if self.failing_patterns.contains(&label) || self.failing_units.contains(area.unit.as_str())
        {
            return TaskResult::from_error(PqError::Execution(format!(
                "scripted failure for {label} on {}",
                area.unit
            )));
        }
        let header = Header::new(vec![Field::new("s.v", DataType::Integer)]);
        let rows = vec![Row::new(1, vec![Value::I64(1)])];
        TaskResult::from_stream(Box::new(MemTable::new(header, rows).into_stream()))
    }
}

#[async_trait]
impl StorageAdapter for MockAdapter {
    async fn execute_project(&self, op: &Operator, area: &DataArea) -> TaskResult {
        let label = match op {
            Operator::Project { patterns, .. } => patterns.join(","),
            _ => "project".to_string(),
        };
        self.run(label, area).await
    }

    async fn execute_insert(&self, _op: &Operator, area: &DataArea) -> TaskResult {
        self.run("insert".to_string(), area).await
    }

    async fn execute_delete(&self, _op: &Operator, area: &DataArea) -> TaskResult {
        self.run("delete".to_string(), area).await
    }

    async fn get_columns(&self) -> pq_common::Result<Vec<Field>> {
        Ok(Vec::new())
    }

    async fn get_boundary_of_storage(&self) -> pq_common::Result<KeyInterval> {
        Ok(KeyInterval::full())
    }

    async fn echo(&self, _timeout: Duration) -> pq_common::Result<()> {
        Ok(())
    }

    async fn release(&self) -> pq_common::Result<()> {
        self.released.store(true, Ordering::Release);
        Ok(())
    }
}

fn unit_meta(name: &str, engine: u64, is_master: bool) -> StorageUnitMeta {
    StorageUnitMeta {
        id: StorageUnitId::new(name),
        storage_engine: StorageEngineId(engine),
        is_master,
    }
}

fn single_unit_fragment() -> FragmentMeta {
    FragmentMeta {
        id: FragmentId("frag_0".to_string()),
        key_interval: KeyInterval::new(0, 1000),
        master_unit: unit_meta("du_0", 0, true),
        replica_units: Vec::new(),
    }
}

fn replicated_fragment() -> FragmentMeta {
    FragmentMeta {
        id: FragmentId("frag_r".to_string()),
        key_interval: KeyInterval::new(0, 1000),
        master_unit: unit_meta("du_0", 0, true),
        replica_units: vec![unit_meta("du_1", 1, false), unit_meta("du_2", 2, false)],
    }
}

fn project_task(fragment: FragmentMeta, label: &str) -> Arc<PhysicalTask> {
    Arc::new(
        PhysicalTask::new(
            vec![Operator::Project {
                sequence: 0,
                patterns: vec![label.to_string()],
            }],
            fragment,
            KeyInterval::new(0, 1000),
        )
        .unwrap()
        .with_context(ContextId(1)),
    )
}

struct Fixture {
    dispatcher: StorageDispatcher,
    executions: Arc<Mutex<Vec<(StorageUnitId, String)>>>,
    sessions: Arc<SessionRegistry>,
}

fn build_dispatcher(config: EngineConfig, adapter_for: impl Fn(&Arc<Mutex<Vec<(StorageUnitId, String)>>>) -> MockAdapter, fragment: &FragmentMeta) -> Fixture {
    let executions = Arc::new(Mutex::new(Vec::new()));
    let sessions = Arc::new(SessionRegistry::new());
    let store: Arc<dyn CheckpointStore> = Arc::new(NullCheckpointStore);
    let policy = Arc::new(PersistencePolicy::with_strategy(
        false,
        Arc::clone(&store),
        Box::new(NoPersist),
    ));
    let dispatcher = StorageDispatcher::new(
        config,
        DispatcherDeps {
            policy,
            checkpoints: store,
            sessions: Arc::clone(&sessions),
            adapters: Arc::new(AdapterRegistry::new()),
            selector: Box::new(MasterOnlySelector),
        },
    )
    .unwrap();

    let adapter: Arc<dyn StorageAdapter> = Arc::new(adapter_for(&executions));
    for meta in fragment.all_units() {
        dispatcher.register_gateway(Arc::new(StorageGateway::new(
            meta.storage_engine,
            Arc::clone(&adapter),
        )));
        dispatcher.register_storage_unit(meta.clone());
    }
    Fixture {
        dispatcher,
        executions,
        sessions,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout");
}

#[tokio::test]
async fn dispatcher_executes_submitted_task_and_records_span() {
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(EngineConfig::default(), |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let task = project_task(fragment, "t0");
    fx.dispatcher.submit(Arc::clone(&task));
    wait_until(|| task.has_result()).await;

    let mut result = task.take_result().unwrap();
    assert!(result.is_ok());
    assert!(result.take_stream().is_some());
    assert_eq!(fx.executions.lock().len(), 1);
}

#[tokio::test]
async fn dispatcher_rejects_tasks_beyond_backlog_ceiling() {
    let config = EngineConfig {
        worker_pool_size_per_storage: 1,
        max_cached_tasks_per_storage: 2,
        ..EngineConfig::default()
    };
    let gate = Arc::new(Semaphore::new(0));
    let fragment = single_unit_fragment();
    let gate_for_adapter = Arc::clone(&gate);
    let fx = build_dispatcher(
        config,
        move |e| MockAdapter::new(Arc::clone(e)).gated(Arc::clone(&gate_for_adapter)),
        &fragment,
    );

    let tasks: Vec<_> = (0..4)
        .map(|i| project_task(fragment.clone(), &format!("t{i}")))
        .collect();
    for task in &tasks {
        fx.dispatcher.submit(Arc::clone(task));
    }

    // The two over-ceiling tasks fail immediately, before any execution.
    wait_until(|| tasks[2].has_result() && tasks[3].has_result()).await;
    for rejected in &tasks[2..] {
        let err = rejected.take_result().unwrap().into_error().unwrap();
        assert!(matches!(err, PqError::Overloaded { .. }), "got {err}");
    }

    gate.add_permits(16);
    wait_until(|| tasks[0].has_result() && tasks[1].has_result()).await;
    assert!(tasks[0].take_result().unwrap().is_ok());

    // Rejected tasks never reached the adapter.
    assert_eq!(fx.executions.lock().len(), 2);
}

#[tokio::test]
async fn dispatcher_preserves_fifo_order_within_unit() {
    let config = EngineConfig {
        worker_pool_size_per_storage: 1,
        max_cached_tasks_per_storage: 64,
        ..EngineConfig::default()
    };
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(config, |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let tasks: Vec<_> = (0..5)
        .map(|i| project_task(fragment.clone(), &format!("t{i}")))
        .collect();
    for task in &tasks {
        fx.dispatcher.submit(Arc::clone(task));
    }
    wait_until(|| tasks.iter().all(|t| t.has_result())).await;

    let labels: Vec<String> = fx.executions.lock().iter().map(|(_, l)| l.clone()).collect();
    assert_eq!(labels, vec!["t0", "t1", "t2", "t3", "t4"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifo_order_holds_on_a_multi_thread_runtime() {
    let config = EngineConfig {
        worker_pool_size_per_storage: 1,
        max_cached_tasks_per_storage: 64,
        ..EngineConfig::default()
    };
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(config, |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let tasks: Vec<_> = (0..8)
        .map(|i| project_task(fragment.clone(), &format!("t{i}")))
        .collect();
    for task in &tasks {
        fx.dispatcher.submit(Arc::clone(task));
    }
    wait_until(|| tasks.iter().all(|t| t.has_result())).await;

    let labels: Vec<String> = fx.executions.lock().iter().map(|(_, l)| l.clone()).collect();
    let expected: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
    assert_eq!(labels, expected);
}

#[tokio::test]
async fn dispatcher_drops_tasks_for_closed_sessions() {
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(EngineConfig::default(), |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let session = SessionId(9);
    fx.sessions.close(session);
    let task = Arc::new(
        PhysicalTask::new(
            vec![Operator::Project {
                sequence: 0,
                patterns: vec!["t".to_string()],
            }],
            fragment,
            KeyInterval::new(0, 1000),
        )
        .unwrap()
        .with_session(session),
    );
    fx.dispatcher.submit(Arc::clone(&task));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.has_result());
    assert!(fx.executions.lock().is_empty());
}

#[tokio::test]
async fn one_failing_task_does_not_stall_the_queue() {
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(
        EngineConfig::default(),
        |e| MockAdapter::new(Arc::clone(e)).failing("bad"),
        &fragment,
    );

    let bad = project_task(fragment.clone(), "bad");
    let good = project_task(fragment, "good");
    fx.dispatcher.submit(Arc::clone(&bad));
    fx.dispatcher.submit(Arc::clone(&good));

    wait_until(|| bad.has_result() && good.has_result()).await;
    assert!(bad.take_result().unwrap().error().is_some());
    assert!(good.take_result().unwrap().is_ok());
}

#[tokio::test]
async fn broadcast_write_reaches_every_replica() {
    let fragment = replicated_fragment();
    let fx = build_dispatcher(EngineConfig::default(), |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let rows = MemTable::new(
        Header::new(vec![Field::new("s.v", DataType::Integer)]),
        vec![Row::new(1, vec![Value::I64(10)])],
    );
    let task = Arc::new(
        PhysicalTask::new(
            vec![Operator::Insert {
                sequence: 0,
                rows,
            }],
            fragment,
            KeyInterval::new(0, 1000),
        )
        .unwrap()
        .with_broadcasting(true),
    );
    fx.dispatcher.submit(Arc::clone(&task));

    wait_until(|| fx.executions.lock().len() == 3).await;
    let units: HashSet<String> = fx
        .executions
        .lock()
        .iter()
        .map(|(u, _)| u.to_string())
        .collect();
    assert_eq!(
        units,
        HashSet::from(["du_0".to_string(), "du_1".to_string(), "du_2".to_string()])
    );
}

#[tokio::test]
async fn follower_runs_after_all_parents_complete() {
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(EngineConfig::default(), |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let p1 = project_task(fragment.clone(), "p1");
    let p2 = project_task(fragment.clone(), "p2");
    let child = Arc::new(
        PhysicalTask::new(
            vec![Operator::Project {
                sequence: 1,
                patterns: vec!["child".to_string()],
            }],
            fragment,
            KeyInterval::new(0, 1000),
        )
        .unwrap()
        .with_parents(vec![Arc::clone(&p1), Arc::clone(&p2)]),
    );
    PhysicalTask::link_follower(&child);

    fx.dispatcher.submit(Arc::clone(&p1));
    fx.dispatcher.submit(Arc::clone(&p2));

    wait_until(|| child.has_result()).await;
    let labels: Vec<String> = fx.executions.lock().iter().map(|(_, l)| l.clone()).collect();
    assert_eq!(labels.last().unwrap(), "child");
}

#[tokio::test]
async fn blocked_gateway_fails_tasks_fast() {
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(EngineConfig::default(), |e| MockAdapter::new(Arc::clone(e)), &fragment);

    fx.dispatcher
        .gateway(StorageEngineId(0))
        .unwrap()
        .set_blocked(true);
    let task = project_task(fragment, "t0");
    fx.dispatcher.submit(Arc::clone(&task));

    wait_until(|| task.has_result()).await;
    let err = task.take_result().unwrap().into_error().unwrap();
    assert!(matches!(err, PqError::Unavailable(_)), "got {err}");
    assert!(fx.executions.lock().is_empty());
}

#[tokio::test]
async fn metadata_hook_registers_new_units_without_restart() {
    let fragment = single_unit_fragment();
    let fx = build_dispatcher(EngineConfig::default(), |e| MockAdapter::new(Arc::clone(e)), &fragment);

    let new_unit = unit_meta("du_new", 0, false);
    fx.dispatcher.on_storage_unit_created(None, &new_unit);

    let new_fragment = FragmentMeta {
        id: FragmentId("frag_new".to_string()),
        key_interval: KeyInterval::new(0, 10),
        master_unit: new_unit,
        replica_units: Vec::new(),
    };
    let task = project_task(new_fragment, "t0");
    fx.dispatcher.submit(Arc::clone(&task));
    wait_until(|| task.has_result()).await;
    assert!(task.take_result().unwrap().is_ok());
}

#[tokio::test]
async fn failed_read_is_replayed_on_a_backup_unit() {
    let fragment = replicated_fragment();
    let fx = build_dispatcher(
        EngineConfig::default(),
        |e| MockAdapter::new(Arc::clone(e)).failing_on_unit("du_0"),
        &fragment,
    );

    let task = project_task(fragment, "t0");
    fx.dispatcher.submit(Arc::clone(&task));
    wait_until(|| task.has_result()).await;

    // The master failed outright, so the first replica serves the read and
    // the caller never observes the failure.
    let mut result = task.take_result().unwrap();
    assert!(result.is_ok());
    assert!(result.take_stream().is_some());
    let units: Vec<String> = fx.executions.lock().iter().map(|(u, _)| u.to_string()).collect();
    assert_eq!(units, vec!["du_0", "du_1"]);
}

#[tokio::test]
async fn shutdown_waits_for_inflight_workers_before_releasing_adapters() {
    let gate = Arc::new(Semaphore::new(0));
    let released = Arc::new(AtomicBool::new(false));
    let fragment = single_unit_fragment();
    let gate_for_adapter = Arc::clone(&gate);
    let released_for_adapter = Arc::clone(&released);
    let fx = build_dispatcher(
        EngineConfig::default(),
        move |e| {
            MockAdapter::new(Arc::clone(e))
                .gated(Arc::clone(&gate_for_adapter))
                .release_flag(Arc::clone(&released_for_adapter))
        },
        &fragment,
    );

    let task = project_task(fragment, "t0");
    fx.dispatcher.submit(Arc::clone(&task));
    wait_until(|| fx.executions.lock().len() == 1).await;

    let dispatcher = fx.dispatcher.clone();
    let shutdown = tokio::spawn(async move { dispatcher.shutdown().await });

    // The worker is still blocked inside the adapter; shutdown must not
    // release it out from under the execution.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());
    assert!(!released.load(Ordering::Acquire));

    gate.add_permits(1);
    shutdown.await.unwrap();
    assert!(task.has_result());
    assert!(released.load(Ordering::Acquire));
}
