use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    dispatch_submitted: CounterVec,
    dispatch_succeeded: CounterVec,
    dispatch_failed: CounterVec,
    dispatch_rejected_overload: CounterVec,
    dispatch_dropped_canceled: CounterVec,
    dispatch_broadcast_copies: CounterVec,
    dispatch_inflight_tasks: GaugeVec,
    task_span_seconds: HistogramVec,
    checkpoint_persisted: CounterVec,
    checkpoint_persist_bytes: CounterVec,
    checkpoint_persist_failures: CounterVec,
    repeater_replays: CounterVec,
    repeater_rows_stitched: CounterVec,
    heartbeat_failures: CounterVec,
    proposals_started: CounterVec,
    storages_blocked: GaugeVec,
    reconnect_attempts: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_submitted(&self, unit: &str) {
        self.inner
            .dispatch_submitted
            .with_label_values(&[unit])
            .inc();
    }

    pub fn inc_succeeded(&self, unit: &str) {
        self.inner
            .dispatch_succeeded
            .with_label_values(&[unit])
            .inc();
    }

    pub fn inc_failed(&self, unit: &str) {
        self.inner.dispatch_failed.with_label_values(&[unit]).inc();
    }

    pub fn inc_rejected_overload(&self, unit: &str) {
        self.inner
            .dispatch_rejected_overload
            .with_label_values(&[unit])
            .inc();
    }

    pub fn inc_dropped_canceled(&self, unit: &str) {
        self.inner
            .dispatch_dropped_canceled
            .with_label_values(&[unit])
            .inc();
    }

    pub fn inc_broadcast_copies(&self, unit: &str, copies: u64) {
        self.inner
            .dispatch_broadcast_copies
            .with_label_values(&[unit])
            .inc_by(copies as f64);
    }

    pub fn set_inflight_tasks(&self, unit: &str, inflight: u64) {
        self.inner
            .dispatch_inflight_tasks
            .with_label_values(&[unit])
            .set(inflight as f64);
    }

    pub fn observe_task_span(&self, unit: &str, secs: f64) {
        self.inner
            .task_span_seconds
            .with_label_values(&[unit])
            .observe(secs.max(0.0));
    }

    pub fn inc_checkpoint_persisted(&self, context_id: &str, bytes: u64) {
        self.inner
            .checkpoint_persisted
            .with_label_values(&[context_id])
            .inc();
        self.inner
            .checkpoint_persist_bytes
            .with_label_values(&[context_id])
            .inc_by(bytes as f64);
    }

    pub fn inc_checkpoint_persist_failure(&self, context_id: &str) {
        self.inner
            .checkpoint_persist_failures
            .with_label_values(&[context_id])
            .inc();
    }

    pub fn inc_repeater_replay(&self, unit: &str) {
        self.inner.repeater_replays.with_label_values(&[unit]).inc();
    }

    pub fn inc_repeater_rows_stitched(&self, unit: &str, rows: u64) {
        self.inner
            .repeater_rows_stitched
            .with_label_values(&[unit])
            .inc_by(rows as f64);
    }

    pub fn inc_heartbeat_failure(&self, storage_id: &str) {
        self.inner
            .heartbeat_failures
            .with_label_values(&[storage_id])
            .inc();
    }

    pub fn inc_proposal_started(&self, storage_id: &str, kind: &str) {
        self.inner
            .proposals_started
            .with_label_values(&[storage_id, kind])
            .inc();
    }

    pub fn set_storages_blocked(&self, blocked: u64) {
        self.inner
            .storages_blocked
            .with_label_values(&[])
            .set(blocked as f64);
    }

    pub fn inc_reconnect_attempt(&self, storage_id: &str) {
        self.inner
            .reconnect_attempts
            .with_label_values(&[storage_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let dispatch_submitted = counter_vec(
            &registry,
            "pq_dispatch_submitted_total",
            "Tasks submitted per storage unit",
            &["unit"],
        );
        let dispatch_succeeded = counter_vec(
            &registry,
            "pq_dispatch_succeeded_total",
            "Tasks completed successfully per storage unit",
            &["unit"],
        );
        let dispatch_failed = counter_vec(
            &registry,
            "pq_dispatch_failed_total",
            "Tasks completed with an error per storage unit",
            &["unit"],
        );
        let dispatch_rejected_overload = counter_vec(
            &registry,
            "pq_dispatch_rejected_overload_total",
            "Tasks rejected by the backlog ceiling",
            &["unit"],
        );
        let dispatch_dropped_canceled = counter_vec(
            &registry,
            "pq_dispatch_dropped_canceled_total",
            "Tasks dropped because their session closed",
            &["unit"],
        );
        let dispatch_broadcast_copies = counter_vec(
            &registry,
            "pq_dispatch_broadcast_copies_total",
            "Replica broadcast copies enqueued",
            &["unit"],
        );
        let dispatch_inflight_tasks = gauge_vec(
            &registry,
            "pq_dispatch_inflight_tasks",
            "Currently executing tasks per storage unit",
            &["unit"],
        );
        let task_span_seconds = histogram_vec(
            &registry,
            "pq_task_span_seconds",
            "Wall-clock execution span per task",
            &["unit"],
        );

        let checkpoint_persisted = counter_vec(
            &registry,
            "pq_checkpoint_persisted_total",
            "Row streams persisted to the checkpoint store",
            &["context_id"],
        );
        let checkpoint_persist_bytes = counter_vec(
            &registry,
            "pq_checkpoint_persist_bytes_total",
            "Estimated bytes persisted to the checkpoint store",
            &["context_id"],
        );
        let checkpoint_persist_failures = counter_vec(
            &registry,
            "pq_checkpoint_persist_failures_total",
            "Best-effort checkpoint writes that failed",
            &["context_id"],
        );

        let repeater_replays = counter_vec(
            &registry,
            "pq_repeater_replays_total",
            "Backup replays triggered by mid-stream read failures",
            &["unit"],
        );
        let repeater_rows_stitched = counter_vec(
            &registry,
            "pq_repeater_rows_stitched_total",
            "Rows recovered by stitching partial tables",
            &["unit"],
        );

        let heartbeat_failures = counter_vec(
            &registry,
            "pq_heartbeat_failures_total",
            "Failed heartbeat rounds per storage engine",
            &["storage_id"],
        );
        let proposals_started = counter_vec(
            &registry,
            "pq_proposals_started_total",
            "Liveness proposals started, by kind (loss|restore)",
            &["storage_id", "kind"],
        );
        let storages_blocked = gauge_vec(
            &registry,
            "pq_storages_blocked",
            "Storage engines currently blocked by the liveness protocol",
            &[],
        );
        let reconnect_attempts = counter_vec(
            &registry,
            "pq_reconnect_attempts_total",
            "Reconnection attempts for storages that failed to initialize",
            &["storage_id"],
        );

        Self {
            registry,
            dispatch_submitted,
            dispatch_succeeded,
            dispatch_failed,
            dispatch_rejected_overload,
            dispatch_dropped_canceled,
            dispatch_broadcast_copies,
            dispatch_inflight_tasks,
            task_span_seconds,
            checkpoint_persisted,
            checkpoint_persist_bytes,
            checkpoint_persist_failures,
            repeater_replays,
            repeater_rows_stitched,
            heartbeat_failures,
            proposals_started,
            storages_blocked,
            reconnect_attempts,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.inc_submitted("du_0");
        m.inc_rejected_overload("du_0");
        let text = m.render_prometheus();
        assert!(text.contains("pq_dispatch_submitted_total"));
        assert!(text.contains("du_0"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.inc_submitted("du_1");
        m.inc_succeeded("du_1");
        m.inc_failed("du_1");
        m.inc_dropped_canceled("du_1");
        m.inc_broadcast_copies("du_1", 2);
        m.set_inflight_tasks("du_1", 3);
        m.observe_task_span("du_1", 0.02);
        m.inc_checkpoint_persisted("7", 4096);
        m.inc_checkpoint_persist_failure("7");
        m.inc_repeater_replay("du_1");
        m.inc_repeater_rows_stitched("du_1", 40);
        m.inc_heartbeat_failure("2");
        m.inc_proposal_started("2", "loss");
        m.set_storages_blocked(1);
        m.inc_reconnect_attempt("2");
        let text = m.render_prometheus();

        assert!(text.contains("pq_dispatch_succeeded_total"));
        assert!(text.contains("pq_dispatch_failed_total"));
        assert!(text.contains("pq_dispatch_dropped_canceled_total"));
        assert!(text.contains("pq_dispatch_broadcast_copies_total"));
        assert!(text.contains("pq_dispatch_inflight_tasks"));
        assert!(text.contains("pq_task_span_seconds"));
        assert!(text.contains("pq_checkpoint_persisted_total"));
        assert!(text.contains("pq_checkpoint_persist_failures_total"));
        assert!(text.contains("pq_repeater_replays_total"));
        assert!(text.contains("pq_repeater_rows_stitched_total"));
        assert!(text.contains("pq_heartbeat_failures_total"));
        assert!(text.contains("pq_proposals_started_total"));
        assert!(text.contains("pq_storages_blocked"));
        assert!(text.contains("pq_reconnect_attempts_total"));
    }
}
