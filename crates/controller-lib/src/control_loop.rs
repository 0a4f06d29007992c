//! The control loop: ties pod discovery, latency ingestion, the control
//! law, and the cgroup driver together into one periodic tick.
//!
//! Grounded on the teacher's `collector::loop::CollectionLoop` for loop
//! shape (`tokio::select!` over a ticker and a shutdown broadcast
//! receiver) and on `docker/drcio/controller.py::control_loop_iteration`/
//! `_apply_new_weights` for the exact per-tick algorithm and failure
//! semantics. Jitter is intentionally not carried over from the teacher's
//! collection loop: the control tick has no thundering-herd concern (it's
//! one process per node) and spec'd cooldown/hysteresis already damps
//! oscillation.

use crate::cgroup::CgroupDriver;
use crate::control_law::compute_setpoint;
use crate::errors::ErrorKind;
use crate::latency::LatencyFailure;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::types::{DeviceId, PodRef, Setpoint};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Pod-discovery collaborator, implemented by `cluster::ClusterView` in
/// production and by fakes in tests. `Err` means the underlying API call
/// failed outright, distinct from `Ok` carrying empty sets because no pod
/// on the node matched.
#[async_trait]
pub trait PodDiscovery: Send + Sync {
    async fn discover(&self) -> Result<(Vec<PodRef>, Vec<PodRef>), ()>;
}

#[async_trait]
impl PodDiscovery for crate::cluster::ClusterView {
    async fn discover(&self) -> Result<(Vec<PodRef>, Vec<PodRef>), ()> {
        crate::cluster::ClusterView::discover(self).await.map_err(|e| {
            warn!(error = %e, "pod discovery failed");
        })
    }
}

/// Latency-signal collaborator, implemented by
/// `latency::PrometheusLatencySource` in production and by fakes in tests.
#[async_trait]
pub trait LatencySignal: Send + Sync {
    async fn current_latency_ms(&self) -> Result<f64, LatencyFailure>;
}

#[async_trait]
impl LatencySignal for crate::latency::PrometheusLatencySource {
    async fn current_latency_ms(&self) -> Result<f64, LatencyFailure> {
        crate::latency::PrometheusLatencySource::current_latency_ms(self).await
    }
}

/// Number of consecutive latency-source failures after which every
/// subsequent failure escalates to a `warn` log (spec.md §7).
const CONSECUTIVE_FAILURE_WARN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    pub tick_interval: Duration,
    pub adjustment_cooldown: Duration,
    pub sla_threshold_ms: f64,
    pub min_weight: u32,
    pub max_weight: u32,
    pub policy: PolicyConfig,
}

/// Static policy configuration; `PolicyConfig::Bandwidth` carries the base
/// read/write caps scaled by the setpoint's weight fraction each tick
/// (see `ControlLoop::apply_to_class`) — the control law still drives
/// bandwidth mode, it just renders the setpoint differently.
#[derive(Debug, Clone)]
pub enum PolicyConfig {
    Weight,
    Bandwidth {
        device: DeviceId,
        base_read_bps: Option<u64>,
        base_write_bps: Option<u64>,
    },
}

impl PolicyConfig {
    fn control_file(&self) -> &'static str {
        match self {
            PolicyConfig::Weight => "io.weight",
            PolicyConfig::Bandwidth { .. } => "io.max",
        }
    }
}

/// A snapshot of controller state safe to hand to the telemetry surface.
/// Produced by `ControllerState::snapshot`, never mutated after return.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub setpoint: Setpoint,
    pub last_applied_unix: Option<i64>,
    pub hp_count: usize,
    pub lp_count: usize,
    pub adjustments_total: u64,
    pub last_error: Option<String>,
}

/// Process-wide controller state, exclusively owned by the control loop
/// task and exposed to the HTTP layer as a read-only snapshot through an
/// `Arc<RwLock<..>>` — the same pattern the teacher's `HealthRegistry`
/// uses for its component map.
pub struct ControllerState {
    inner: RwLock<StateSnapshot>,
}

impl ControllerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StateSnapshot {
                setpoint: Setpoint::initial(),
                last_applied_unix: None,
                hp_count: 0,
                lp_count: 0,
                adjustments_total: 0,
                last_error: None,
            }),
        })
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.read().await.clone()
    }

    async fn set_pod_counts(&self, hp_count: usize, lp_count: usize) {
        let mut state = self.inner.write().await;
        state.hp_count = hp_count;
        state.lp_count = lp_count;
    }

    async fn set_last_error(&self, message: String) {
        self.inner.write().await.last_error = Some(message);
    }

    /// Atomically advance `(setpoint, last_applied_ts)` together so
    /// observers never see a torn pair.
    async fn commit(&self, setpoint: Setpoint, now_unix: i64) {
        let mut state = self.inner.write().await;
        state.setpoint = setpoint;
        state.last_applied_unix = Some(now_unix);
        state.adjustments_total += 1;
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            inner: RwLock::new(StateSnapshot {
                setpoint: Setpoint::initial(),
                last_applied_unix: None,
                hp_count: 0,
                lp_count: 0,
                adjustments_total: 0,
                last_error: None,
            }),
        }
    }
}

pub struct ControlLoop<D: PodDiscovery, L: LatencySignal> {
    discovery: D,
    latency: L,
    cgroup: Arc<CgroupDriver>,
    state: Arc<ControllerState>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    config: ControlLoopConfig,
    last_applied_at: Option<Instant>,
    consecutive_latency_failures: AtomicU32,
}

/// Per-class apply outcome for one tick, surfaced in the structured log.
#[derive(Debug, Default, Clone, Copy)]
struct ApplyOutcome {
    succeeded_pods: usize,
    attempted_pods: usize,
}

impl<D: PodDiscovery, L: LatencySignal> ControlLoop<D, L> {
    pub fn new(
        discovery: D,
        latency: L,
        cgroup: Arc<CgroupDriver>,
        state: Arc<ControllerState>,
        metrics: ControllerMetrics,
        logger: StructuredLogger,
        config: ControlLoopConfig,
    ) -> Self {
        Self {
            discovery,
            latency,
            cgroup,
            state,
            metrics,
            logger,
            config,
            last_applied_at: None,
            consecutive_latency_failures: AtomicU32::new(0),
        }
    }

    /// Run until `shutdown` fires. Does not interrupt an in-flight cgroup
    /// write: the shutdown receiver is only observed between ticks and
    /// after the sleep, per spec.md §5.
    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "starting control loop"
        );
        loop {
            self.tick_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.recv() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }

    /// Execute exactly one tick. Public so tests can drive it directly
    /// against fake collaborators without running the sleep loop.
    pub async fn tick_once(&mut self) {
        let start = Instant::now();
        let outcome = self.tick_body().await;
        self.metrics.observe_tick_duration(start.elapsed().as_secs_f64());
        if let Err(e) = outcome {
            warn!(error = %e, "unexpected error in control loop tick");
            self.metrics.inc_error(ErrorKind::ControlLoop);
            self.state.set_last_error(e.to_string()).await;
        }
    }

    async fn tick_body(&mut self) -> anyhow::Result<()> {
        let (hp_pods, lp_pods) = match self.discovery.discover().await {
            Ok(sets) => sets,
            Err(()) => {
                self.metrics.inc_error(ErrorKind::PodDiscovery);
                self.state
                    .set_last_error("pod_discovery: kubernetes API call failed".to_string())
                    .await;
                return Ok(());
            }
        };
        self.state
            .set_pod_counts(hp_pods.len(), lp_pods.len())
            .await;
        self.metrics.set_pod_counts(hp_pods.len(), lp_pods.len());

        if hp_pods.is_empty() {
            debug!("no HP pods discovered; skipping tick");
            return Ok(());
        }

        let latency_ms = match self.latency.current_latency_ms().await {
            Ok(ms) => {
                self.consecutive_latency_failures.store(0, Ordering::Relaxed);
                ms
            }
            Err(kind) => {
                let n = self.consecutive_latency_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let error_kind = match kind {
                    LatencyFailure::Transport => ErrorKind::PrometheusQuery,
                    LatencyFailure::Parse => ErrorKind::PrometheusParse,
                };
                self.metrics.inc_error(error_kind);
                if n >= CONSECUTIVE_FAILURE_WARN_THRESHOLD {
                    self.logger.log_latency_source_degraded(n);
                } else {
                    debug!(kind = %error_kind, "latency read failed; skipping tick");
                }
                return Ok(());
            }
        };
        self.metrics.set_hp_latency_ms(latency_ms);

        let current = self.state.snapshot().await.setpoint;
        let candidate = compute_setpoint(
            latency_ms,
            self.config.sla_threshold_ms,
            self.config.min_weight,
            self.config.max_weight,
        );

        if candidate.weights_eq(&current) {
            debug!("setpoint unchanged; skipping tick");
            return Ok(());
        }

        if let Some(last) = self.last_applied_at {
            if last.elapsed() < self.config.adjustment_cooldown {
                debug!(
                    elapsed_secs = last.elapsed().as_secs_f64(),
                    cooldown_secs = self.config.adjustment_cooldown.as_secs_f64(),
                    "adjustment suppressed by cooldown"
                );
                return Ok(());
            }
        }

        let hp_outcome = self
            .apply_to_class(&hp_pods, candidate.hp_weight, self.config.max_weight)
            .await;
        let lp_outcome = self
            .apply_to_class(&lp_pods, candidate.lp_weight, self.config.max_weight)
            .await;

        let total_succeeded = hp_outcome.succeeded_pods + lp_outcome.succeeded_pods;
        if total_succeeded == 0 {
            warn!("apply_failed: zero writes succeeded across HP and LP pods this tick");
            self.metrics.inc_error(ErrorKind::IoWeightWrite);
            self.state
                .set_last_error("apply_failed: no cgroup writes succeeded".to_string())
                .await;
            return Ok(());
        }

        let now_unix = chrono::Utc::now().timestamp();
        self.state.commit(candidate, now_unix).await;
        self.last_applied_at = Some(Instant::now());
        self.metrics.set_setpoint(candidate.hp_weight, candidate.lp_weight);
        self.metrics.set_last_adjustment_unix(now_unix);
        self.metrics.inc_adjustments();

        self.logger.log_adjustment(
            current.hp_weight,
            current.lp_weight,
            candidate.hp_weight,
            candidate.lp_weight,
            latency_ms,
            hp_outcome.succeeded_pods,
            hp_outcome.attempted_pods,
            lp_outcome.succeeded_pods,
            lp_outcome.attempted_pods,
        );

        Ok(())
    }

    async fn apply_to_class(&self, pods: &[PodRef], weight: u32, max_weight: u32) -> ApplyOutcome {
        let mut outcome = ApplyOutcome {
            attempted_pods: pods.len(),
            ..Default::default()
        };
        let control_file = self.config.policy.control_file();

        for pod in pods {
            let handle = match self.cgroup.resolve_pod_cgroup(&pod.pod_id, control_file).await {
                Ok(h) => h,
                Err(_) => {
                    self.metrics.inc_error(ErrorKind::CgroupNotFound);
                    continue;
                }
            };

            let result = match &self.config.policy {
                PolicyConfig::Weight => self.cgroup.apply_weight(&handle, weight).await,
                PolicyConfig::Bandwidth {
                    device,
                    base_read_bps,
                    base_write_bps,
                } => {
                    let fraction = weight as f64 / max_weight as f64;
                    let rbps = scale_bandwidth(*base_read_bps, fraction);
                    let wbps = scale_bandwidth(*base_write_bps, fraction);
                    self.cgroup
                        .apply_bandwidth_cap(&handle, *device, &rbps, &wbps)
                        .await
                }
            };

            match result {
                Ok(tally) => {
                    self.record_tally_errors(&tally);
                    if tally.succeeded > 0 {
                        outcome.succeeded_pods += 1;
                    }
                }
                Err(e) => self.metrics.inc_error(ErrorKind::from(&e)),
            }
        }

        outcome
    }

    /// Count every individual file failure from a `WriteTally`, even on a
    /// pod whose other files wrote successfully (spec.md §4.1: "Each
    /// individual file failure is classified ... and counted").
    fn record_tally_errors(&self, tally: &crate::cgroup::WriteTally) {
        for _ in 0..tally.permission_denied {
            self.metrics.inc_error(ErrorKind::PermissionDenied);
        }
        for _ in 0..tally.io_error {
            self.metrics.inc_error(ErrorKind::IoWeightWrite);
        }
        for _ in 0..tally.not_found {
            self.metrics.inc_error(ErrorKind::CgroupNotFound);
        }
    }
}

fn scale_bandwidth(base: Option<u64>, fraction: f64) -> String {
    match base {
        None => "max".to_string(),
        Some(bytes) => {
            let scaled = (bytes as f64 * fraction).round() as u64;
            crate::cgroup::format_bandwidth_value(Some(scaled.max(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::fs;

    struct FakeDiscovery {
        hp: Vec<PodRef>,
        lp: Vec<PodRef>,
        fails: bool,
    }

    impl FakeDiscovery {
        fn new(hp: Vec<PodRef>, lp: Vec<PodRef>) -> Self {
            Self { hp, lp, fails: false }
        }
    }

    #[async_trait]
    impl PodDiscovery for FakeDiscovery {
        async fn discover(&self) -> Result<(Vec<PodRef>, Vec<PodRef>), ()> {
            if self.fails {
                return Err(());
            }
            Ok((self.hp.clone(), self.lp.clone()))
        }
    }

    struct FakeLatency {
        value: std::sync::Mutex<Result<f64, LatencyFailure>>,
        calls: AtomicUsize,
    }

    impl FakeLatency {
        fn fixed(ms: f64) -> Self {
            Self {
                value: std::sync::Mutex::new(Ok(ms)),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LatencySignal for FakeLatency {
        async fn current_latency_ms(&self) -> Result<f64, LatencyFailure> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            *self.value.lock().unwrap()
        }
    }

    async fn mock_pod(root: &std::path::Path, uid: &str) -> PodRef {
        let sanitized = uid.replace('-', "_");
        let dir = root.join(format!(
            "kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod{sanitized}.slice"
        ));
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("io.weight"), "default 500\n").await.unwrap();
        PodRef {
            pod_id: uid.to_string(),
            namespace: "fraud-detection".to_string(),
            name: format!("pod-{uid}"),
            node: "node-1".to_string(),
            priority: Priority::Hp,
            container_ids: vec![],
        }
    }

    fn config() -> ControlLoopConfig {
        ControlLoopConfig {
            tick_interval: Duration::from_secs(5),
            adjustment_cooldown: Duration::from_secs(10),
            sla_threshold_ms: 500.0,
            min_weight: 100,
            max_weight: 1000,
            policy: PolicyConfig::Weight,
        }
    }

    #[tokio::test]
    async fn empty_hp_set_skips_tick_without_changing_state() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let discovery = FakeDiscovery::new(vec![], vec![]);
        let latency = FakeLatency::fixed(900.0);

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 0);
        assert_eq!(snap.setpoint.hp_weight, 500);
    }

    #[tokio::test]
    async fn latency_below_threshold_matches_initial_setpoint_no_write() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let hp_pod = mock_pod(tmp.path(), "1111-1111").await;
        let discovery = FakeDiscovery::new(vec![hp_pod], vec![]);
        let latency = FakeLatency::fixed(200.0);

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 0);
        assert_eq!((snap.setpoint.hp_weight, snap.setpoint.lp_weight), (500, 500));
    }

    #[tokio::test]
    async fn scenario_latency_350_applies_600_400_and_advances_state() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let hp_pod = mock_pod(tmp.path(), "2222-2222").await;
        let discovery = FakeDiscovery::new(vec![hp_pod], vec![]);
        let latency = FakeLatency::fixed(350.0);

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 1);
        assert_eq!((snap.setpoint.hp_weight, snap.setpoint.lp_weight), (600, 400));
    }

    #[tokio::test]
    async fn second_tick_within_cooldown_is_suppressed() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let hp_pod = mock_pod(tmp.path(), "3333-3333").await;
        let discovery = FakeDiscovery::new(vec![hp_pod], vec![]);
        let latency = FakeLatency::fixed(600.0);

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;
        let first = state.snapshot().await;
        assert_eq!(first.adjustments_total, 1);
        assert_eq!((first.setpoint.hp_weight, first.setpoint.lp_weight), (800, 200));

        *control_latency_value(&control) = Ok(750.0);
        control.tick_once().await;
        let second = state.snapshot().await;
        // Still suppressed by cooldown (10s) even though the setpoint would differ.
        assert_eq!(second.adjustments_total, 1);
        assert_eq!((second.setpoint.hp_weight, second.setpoint.lp_weight), (800, 200));
    }

    fn control_latency_value<'a, D: PodDiscovery>(
        control: &'a mut ControlLoop<D, FakeLatency>,
    ) -> std::sync::MutexGuard<'a, Result<f64, LatencyFailure>> {
        control.latency.value.lock().unwrap()
    }

    #[tokio::test]
    async fn pod_with_no_cgroup_is_skipped_but_others_still_advance_state() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let good_pod = mock_pod(tmp.path(), "4444-4444").await;
        let missing_pod = PodRef {
            pod_id: "ffff-ffff".to_string(),
            namespace: "fraud-detection".to_string(),
            name: "pod-missing".to_string(),
            node: "node-1".to_string(),
            priority: Priority::Hp,
            container_ids: vec![],
        };
        let discovery = FakeDiscovery::new(vec![good_pod, missing_pod], vec![]);
        let latency = FakeLatency::fixed(350.0);

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 1);
    }

    #[tokio::test]
    async fn all_writes_failing_does_not_advance_state() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        // No pod directories created at all: resolution fails for every pod.
        let missing_pod = PodRef {
            pod_id: "dead-beef".to_string(),
            namespace: "fraud-detection".to_string(),
            name: "pod-missing".to_string(),
            node: "node-1".to_string(),
            priority: Priority::Hp,
            container_ids: vec![],
        };
        let discovery = FakeDiscovery::new(vec![missing_pod], vec![]);
        let latency = FakeLatency::fixed(700.0);

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 0);
        assert_eq!((snap.setpoint.hp_weight, snap.setpoint.lp_weight), (500, 500));
    }

    #[tokio::test]
    async fn latency_source_failure_skips_tick_and_keeps_state() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let hp_pod = mock_pod(tmp.path(), "5555-5555").await;
        let discovery = FakeDiscovery::new(vec![hp_pod], vec![]);
        let latency = FakeLatency {
            value: std::sync::Mutex::new(Err(LatencyFailure::Transport)),
            calls: AtomicUsize::new(0),
        };

        let mut control = ControlLoop::new(discovery, latency, cgroup, state.clone(), metrics, StructuredLogger::new("node-1"), config());
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 0);
    }

    #[tokio::test]
    async fn discovery_failure_skips_tick_and_records_last_error() {
        let tmp = TempDir::new().unwrap();
        let cgroup = Arc::new(CgroupDriver::new(tmp.path()));
        let state = ControllerState::new();
        let metrics = ControllerMetrics::new();
        let mut discovery = FakeDiscovery::new(vec![], vec![]);
        discovery.fails = true;
        let latency = FakeLatency::fixed(900.0);

        let mut control = ControlLoop::new(
            discovery,
            latency,
            cgroup,
            state.clone(),
            metrics,
            StructuredLogger::new("node-1"),
            config(),
        );
        control.tick_once().await;

        let snap = state.snapshot().await;
        assert_eq!(snap.adjustments_total, 0);
        assert_eq!(snap.hp_count, 0);
        assert!(snap.last_error.as_deref().unwrap().contains("pod_discovery"));
    }
}
