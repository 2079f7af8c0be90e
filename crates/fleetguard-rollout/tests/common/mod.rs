//! Scripted providers for orchestrator tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetguard_rollout::{
    ChangeProvider, ChangeReport, CheckResult, ExternalError, MetricsProvider, Notifier,
    OrchestratorSettings, PreCheckProvider, Providers, ReconciliationProvider, RolloutEvent,
};
use fleetguard_state::{Clock, Cluster, StateStore};
use fleetguard_validation::{MetricsSnapshot, TimeWindow, ValidationThresholds, catalog};

pub struct ScriptedPrechecks {
    pub checks: Mutex<Vec<CheckResult>>,
    pub calls: AtomicUsize,
    /// How long each check run takes.
    pub delay: Mutex<Duration>,
    pub in_flight: AtomicUsize,
    /// Most check runs ever in flight at once.
    pub peak: AtomicUsize,
}

#[async_trait]
impl PreCheckProvider for ScriptedPrechecks {
    async fn run_checks(&self, _cluster: &Cluster) -> Result<Vec<CheckResult>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.checks.lock().unwrap().clone())
    }
}

pub struct ScriptedChanges {
    /// Error returned by every proposal while set.
    pub propose_error: Mutex<Option<ExternalError>>,
    /// Error returned by every merge-signal poll while set.
    pub merge_error: Mutex<Option<ExternalError>>,
    pub merged: AtomicBool,
    pub proposals: Mutex<Vec<(String, String, ChangeReport)>>,
    pub propose_calls: AtomicUsize,
}

#[async_trait]
impl ChangeProvider for ScriptedChanges {
    async fn propose_change(
        &self,
        cluster: &Cluster,
        version: &str,
        report: &ChangeReport,
    ) -> Result<String, ExternalError> {
        self.propose_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.propose_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut proposals = self.proposals.lock().unwrap();
        let change_ref = format!("mr-{}", proposals.len() + 1);
        proposals.push((cluster.cluster_id.clone(), version.to_string(), report.clone()));
        Ok(change_ref)
    }

    async fn await_merge_signal(
        &self,
        _change_ref: &str,
        timeout: Duration,
    ) -> Result<bool, ExternalError> {
        if let Some(err) = self.merge_error.lock().unwrap().clone() {
            return Err(err);
        }
        if self.merged.load(Ordering::SeqCst) {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(false)
    }
}

pub struct ScriptedReconciler {
    pub converges: AtomicBool,
    /// Never answer, ignoring the timeout.
    pub hangs: AtomicBool,
}

#[async_trait]
impl ReconciliationProvider for ScriptedReconciler {
    async fn wait_reconciled(
        &self,
        _cluster: &Cluster,
        _timeout: Duration,
    ) -> Result<bool, ExternalError> {
        if self.hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.converges.load(Ordering::SeqCst))
    }
}

/// Each cluster's first call answers with the baseline, every later
/// call with `current`.
pub struct ScriptedMetrics {
    pub baseline: MetricsSnapshot,
    pub current: Mutex<MetricsSnapshot>,
    pub calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedMetrics {
    /// Pretend the baseline for `cluster_id` was captured by an earlier run.
    pub fn skip_baseline(&self, cluster_id: &str) {
        self.calls.lock().unwrap().insert(cluster_id.to_string(), 1);
    }
}

#[async_trait]
impl MetricsProvider for ScriptedMetrics {
    async fn snapshot(
        &self,
        cluster: &Cluster,
        window: TimeWindow,
        _metric_names: &[String],
    ) -> Result<MetricsSnapshot, ExternalError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(cluster.cluster_id.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let snapshot = if call == 0 {
            self.baseline.clone()
        } else {
            self.current.lock().unwrap().clone()
        };
        Ok(snapshot.with_window(window))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<RolloutEvent>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        event: RolloutEvent,
        _payload: serde_json::Value,
    ) -> Result<(), ExternalError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl RecordingNotifier {
    /// Notifications are fire-and-forget; give them a moment to land.
    pub async fn wait_for(&self, event: RolloutEvent) -> bool {
        for _ in 0..100 {
            if self.events.lock().unwrap().contains(&event) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub fn healthy_metrics() -> MetricsSnapshot {
    MetricsSnapshot::new()
        .with(catalog::LATENCY_P95, 100.0)
        .with(catalog::LATENCY_P99, 180.0)
        .with(catalog::ERROR_RATE, 0.0001)
        .with(catalog::REQUEST_COUNT, 5000.0)
        .with(catalog::CPU_USAGE, 40.0)
}

pub fn degraded_metrics() -> MetricsSnapshot {
    healthy_metrics().with(catalog::LATENCY_P95, 150.0)
}

pub fn thresholds() -> ValidationThresholds {
    ValidationThresholds {
        min_request_volume: 100.0,
        ..ValidationThresholds::default()
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        operator_id: Some("op-test".into()),
        soak: Duration::from_secs(60),
        merge_timeout: Duration::from_secs(10 * 60),
        ..OrchestratorSettings::default()
    }
}

/// Handles on every scripted provider plus the bundle given to the orchestrator.
pub struct Harness {
    pub prechecks: Arc<ScriptedPrechecks>,
    pub changes: Arc<ScriptedChanges>,
    pub reconciler: Arc<ScriptedReconciler>,
    pub metrics: Arc<ScriptedMetrics>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            prechecks: Arc::new(ScriptedPrechecks {
                checks: Mutex::new(vec![
                    CheckResult::pass("nodes_ready", "3/3 nodes ready"),
                    CheckResult::pass("pdb_budget", "disruptions allowed"),
                ]),
                calls: AtomicUsize::new(0),
                delay: Mutex::new(Duration::ZERO),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            changes: Arc::new(ScriptedChanges {
                propose_error: Mutex::new(None),
                merge_error: Mutex::new(None),
                merged: AtomicBool::new(true),
                proposals: Mutex::new(Vec::new()),
                propose_calls: AtomicUsize::new(0),
            }),
            reconciler: Arc::new(ScriptedReconciler {
                converges: AtomicBool::new(true),
                hangs: AtomicBool::new(false),
            }),
            metrics: Arc::new(ScriptedMetrics {
                baseline: healthy_metrics(),
                current: Mutex::new(healthy_metrics()),
                calls: Mutex::new(HashMap::new()),
            }),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn providers(&self) -> Providers {
        Providers {
            prechecks: self.prechecks.clone(),
            changes: self.changes.clone(),
            reconciler: self.reconciler.clone(),
            metrics: self.metrics.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn proposals(&self) -> Vec<(String, String, ChangeReport)> {
        self.changes.proposals.lock().unwrap().clone()
    }
}

pub fn store_with(clusters: &[(&str, &str, &str)]) -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    for &(id, batch, version) in clusters {
        store
            .register(Cluster::new(id, batch, "production", "eu-west-1", version))
            .unwrap();
    }
    store
}

/// Wall clock that follows tokio's clock, so leases expire in paused
/// virtual time. Create it inside the test runtime.
#[derive(Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    start_ms: u64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            start_ms: 1_700_000_000_000,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.start_ms + self.origin.elapsed().as_millis() as u64
    }
}
