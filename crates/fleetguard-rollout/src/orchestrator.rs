//! Rollout orchestrator — drives one cluster through the status machine.
//!
//! A run reads the cluster's durable status and executes the phase it is
//! in, then re-reads and continues until it reaches a terminal status or
//! parks at a human gate. Because the status is the only progress marker,
//! a run started after a crash resumes where the previous one stopped.
//!
//! Every phase change is a fenced CAS through the store. Every wait
//! (external calls, merge polling, soak) runs under [`ClusterRun::hold`],
//! which renews the lease in the background and honours cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleetguard_state::{
    Cluster, ClusterStatus, Fence, LeaseManager, StateStore, TransitionOutcome,
    UpgradeHistoryEntry, UpgradeOutcome,
};
use fleetguard_validation::{Comparator, MetricCatalog, MetricsSnapshot, TimeWindow, ValidationThresholds};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{OrchestratorSettings, RolloutConfig};
use crate::error::{ExternalError, RolloutError, RolloutResult};
use crate::providers::{ChangeReport, Providers, RolloutEvent};
use crate::retry::RetryPolicy;

/// How a cluster run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum ClusterOutcome {
    Healthy,
    PreCheckFailed,
    ProposalFailed,
    RolledBack,
    /// Parked at the upgrade approval gate; a later run resumes polling.
    AwaitingApproval,
    AwaitingRollbackApproval,
    /// The revert stalled; an operator has to roll the cluster back.
    RollbackFailed,
    /// Already at the target version.
    Skipped,
    /// Another operator holds the cluster.
    Contended,
    Cancelled,
    Failed(String),
}

impl ClusterOutcome {
    /// The cluster ended at the target version.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Healthy | Self::Skipped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::PreCheckFailed => "pre_check_failed",
            Self::ProposalFailed => "proposal_failed",
            Self::RolledBack => "rolled_back",
            Self::AwaitingApproval => "awaiting_approval",
            Self::AwaitingRollbackApproval => "awaiting_rollback_approval",
            Self::RollbackFailed => "rollback_failed",
            Self::Skipped => "skipped",
            Self::Contended => "contended",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    fn for_terminal(status: ClusterStatus) -> Self {
        match status {
            ClusterStatus::Healthy => Self::Healthy,
            ClusterStatus::PreCheckFailed => Self::PreCheckFailed,
            ClusterStatus::ProposalFailed => Self::ProposalFailed,
            ClusterStatus::FailedRolledBack => Self::RolledBack,
            ClusterStatus::RollbackFailed => Self::RollbackFailed,
            other => Self::Failed(format!("unexpected status {other}")),
        }
    }
}

impl std::fmt::Display for ClusterOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Drives clusters through the rollout.
pub struct Orchestrator {
    pub(crate) store: StateStore,
    pub(crate) leases: LeaseManager,
    pub(crate) providers: Providers,
    pub(crate) comparator: Comparator,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) retry: RetryPolicy,
    operator_id: String,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        providers: Providers,
        settings: OrchestratorSettings,
        thresholds: ValidationThresholds,
    ) -> Self {
        let operator_id = settings
            .operator_id
            .clone()
            .unwrap_or_else(|| format!("fleetguard-{}", uuid::Uuid::new_v4()));
        Self {
            leases: LeaseManager::new(store.clone()),
            store,
            providers,
            comparator: Comparator::new(thresholds),
            settings,
            retry: RetryPolicy::default(),
            operator_id,
        }
    }

    pub fn from_config(store: StateStore, providers: Providers, config: &RolloutConfig) -> Self {
        Self::new(
            store,
            providers,
            config.orchestrator.clone(),
            config.thresholds.clone(),
        )
        .with_retry(config.retry.clone())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_catalog(mut self, catalog: MetricCatalog) -> Self {
        self.comparator = self.comparator.with_catalog(catalog);
        self
    }

    pub fn with_operator_id(mut self, operator_id: &str) -> Self {
        self.operator_id = operator_id.to_string();
        self
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Publish an event without waiting for the notifier.
    pub(crate) fn emit(&self, event: RolloutEvent, payload: serde_json::Value) {
        let notifier = self.providers.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(event, payload).await {
                warn!(?event, error = %e, "notification failed");
            }
        });
    }

    /// Take one cluster toward `target_version`.
    ///
    /// Never fails: errors end up as [`ClusterOutcome::Failed`] and lost
    /// races as [`ClusterOutcome::Contended`].
    pub async fn run_cluster(
        &self,
        cluster_id: &str,
        target_version: &str,
        cancel: CancelToken,
    ) -> ClusterOutcome {
        let result = self.try_run_cluster(cluster_id, target_version, cancel).await;
        settle(cluster_id, result)
    }

    async fn try_run_cluster(
        &self,
        cluster_id: &str,
        target_version: &str,
        cancel: CancelToken,
    ) -> RolloutResult<ClusterOutcome> {
        let cluster = self.store.get(cluster_id)?;
        if cluster.status == ClusterStatus::Healthy && cluster.is_at_version(target_version) {
            info!(%cluster_id, version = %target_version, "already at target version");
            return Ok(ClusterOutcome::Skipped);
        }

        let Some(lease) =
            self.leases
                .acquire_fenced(cluster_id, &self.operator_id, self.settings.lease_ttl)?
        else {
            return Ok(ClusterOutcome::Contended);
        };
        info!(%cluster_id, target = %target_version, status = %cluster.status, "cluster run started");

        let mut run = ClusterRun::new(self, cluster_id, target_version, lease.fence(), cancel);
        let result = run.drive().await;
        self.finish_run(&run, &result);
        result
    }

    pub(crate) fn finish_run(&self, run: &ClusterRun<'_>, result: &RolloutResult<ClusterOutcome>) {
        if let Err(e) = self.leases.release(&run.cluster_id, &run.fence.holder) {
            warn!(cluster_id = %run.cluster_id, error = %e, "lease release failed");
        }
        if let Err(RolloutError::Cancelled(_)) = result {
            self.emit(
                RolloutEvent::Cancelled,
                json!({ "cluster_id": run.cluster_id, "target_version": run.target }),
            );
        }
    }
}

/// Bound a provider wait by `limit`. A provider that overruns its own
/// timeout counts as "not yet".
async fn bounded<F>(limit: Duration, wait: F) -> Result<bool, ExternalError>
where
    F: Future<Output = Result<bool, ExternalError>>,
{
    tokio::time::timeout(limit, wait).await.unwrap_or(Ok(false))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Map an internal result to the outcome reported to callers.
pub(crate) fn settle(cluster_id: &str, result: RolloutResult<ClusterOutcome>) -> ClusterOutcome {
    match result {
        Ok(outcome) => {
            info!(%cluster_id, %outcome, "cluster run finished");
            outcome
        }
        Err(RolloutError::Contention { reason, .. }) => {
            warn!(%cluster_id, %reason, "lost race, aborting");
            ClusterOutcome::Contended
        }
        Err(RolloutError::Cancelled(_)) => {
            info!(%cluster_id, "cluster run cancelled");
            ClusterOutcome::Cancelled
        }
        Err(e) => {
            error!(%cluster_id, error = %e, "cluster run failed");
            ClusterOutcome::Failed(e.to_string())
        }
    }
}

/// What a phase handler asks the driver to do next.
pub(crate) enum Step {
    Continue,
    Done(ClusterOutcome),
}

/// Result of waiting on a merge signal.
pub(crate) enum MergeWait {
    Merged,
    /// Deadline passed without a merge.
    Pending,
    Failed(ExternalError),
}

/// State of one in-flight cluster run.
pub(crate) struct ClusterRun<'a> {
    pub(crate) orch: &'a Orchestrator,
    pub(crate) cluster_id: String,
    pub(crate) target: String,
    pub(crate) fence: Fence,
    cancel: CancelToken,
    started: Instant,
    /// Offset from `started` (ms) at which the lease is next renewed.
    renew_due_ms: AtomicU64,
    /// Rendered violations that triggered a rollback in this run.
    pub(crate) violations: Vec<String>,
}

impl<'a> ClusterRun<'a> {
    pub(crate) fn new(
        orch: &'a Orchestrator,
        cluster_id: &str,
        target: &str,
        fence: Fence,
        cancel: CancelToken,
    ) -> Self {
        Self {
            orch,
            cluster_id: cluster_id.to_string(),
            target: target.to_string(),
            fence,
            cancel,
            started: Instant::now(),
            renew_due_ms: AtomicU64::new(millis(orch.settings.renew_interval)),
            violations: Vec::new(),
        }
    }

    pub(crate) async fn drive(&mut self) -> RolloutResult<ClusterOutcome> {
        let mut entry = true;
        loop {
            let cluster = self.orch.store.get(&self.cluster_id)?;
            let step = self.step(&cluster, entry).await?;
            entry = false;
            if let Step::Done(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    async fn step(&mut self, cluster: &Cluster, entry: bool) -> RolloutResult<Step> {
        use ClusterStatus::*;

        if cluster.status.is_terminal() {
            if !entry {
                return Ok(Step::Done(ClusterOutcome::for_terminal(cluster.status)));
            }
            if cluster.status == Healthy && cluster.is_at_version(&self.target) {
                return Ok(Step::Done(ClusterOutcome::Skipped));
            }
            if cluster.status == RollbackFailed {
                return Ok(Step::Done(ClusterOutcome::RollbackFailed));
            }
            debug!(cluster_id = %self.cluster_id, from = %cluster.status, "re-arming cluster");
            self.advance(cluster.status, Pending, |c| {
                c.target_version = None;
                c.change_ref = None;
                c.rollback_ref = None;
                c.soak_started_at_ms = None;
                c.pre_checks.clear();
                c.last_error = None;
            })?;
            return Ok(Step::Continue);
        }

        if cluster.status != Pending && cluster.target_version.as_deref() != Some(self.target.as_str()) {
            let reason = format!(
                "cluster is {} for version {}, not {}",
                cluster.status,
                cluster.target_version.as_deref().unwrap_or("<none>"),
                self.target
            );
            warn!(cluster_id = %self.cluster_id, %reason, "refusing to take over");
            return Ok(Step::Done(ClusterOutcome::Failed(reason)));
        }

        match cluster.status {
            Pending => {
                if cluster.is_at_version(&self.target) {
                    return Ok(Step::Done(ClusterOutcome::Skipped));
                }
                let target = self.target.clone();
                self.advance(Pending, PreCheckRunning, |c| {
                    c.target_version = Some(target);
                    c.last_error = None;
                })?;
                Ok(Step::Continue)
            }
            PreCheckRunning => self.pre_check(cluster).await,
            PreCheckPassed => self.propose(cluster).await,
            ChangeProposed => {
                self.advance(ChangeProposed, AwaitingApproval, |_| {})?;
                Ok(Step::Continue)
            }
            AwaitingApproval => self.await_approval(cluster).await,
            ChangeApplied => self.await_reconciled(cluster).await,
            Soaking => self.soak(cluster).await,
            Validating => self.validate(cluster).await,
            RollbackRequired | RollbackProposed | AwaitingRollbackApproval => {
                self.rollback_step(cluster).await
            }
            Healthy | PreCheckFailed | ProposalFailed | FailedRolledBack | RollbackFailed => {
                Ok(Step::Done(ClusterOutcome::for_terminal(cluster.status)))
            }
        }
    }

    // ── Store access ───────────────────────────────────────────────

    /// Fenced CAS. A lost race becomes `Contention` when the lease is
    /// still ours and `LeaseLost` when it is not.
    pub(crate) fn advance<F>(
        &self,
        from: ClusterStatus,
        to: ClusterStatus,
        mutate: F,
    ) -> RolloutResult<Cluster>
    where
        F: FnOnce(&mut Cluster),
    {
        let outcome =
            self.orch
                .store
                .transition_with(&self.cluster_id, from, to, Some(&self.fence), mutate)?;
        self.applied(from, outcome)
    }

    /// Fenced update of the record without a status change.
    pub(crate) fn note(&self, status: ClusterStatus, message: &str) -> RolloutResult<Cluster> {
        let message = message.to_string();
        let outcome = self.orch.store.annotate(
            &self.cluster_id,
            status,
            Some(&self.fence),
            |c| c.last_error = Some(message),
        )?;
        self.applied(status, outcome)
    }

    fn applied(&self, expected: ClusterStatus, outcome: TransitionOutcome) -> RolloutResult<Cluster> {
        match outcome {
            TransitionOutcome::Applied(cluster) => Ok(cluster),
            TransitionOutcome::Fenced => Err(RolloutError::LeaseLost(self.cluster_id.clone())),
            TransitionOutcome::Conflict { actual } => {
                if self.orch.leases.check_fence(&self.cluster_id, &self.fence)? {
                    Err(RolloutError::Contention {
                        cluster_id: self.cluster_id.clone(),
                        reason: format!("expected {expected}, found {actual}"),
                    })
                } else {
                    Err(RolloutError::LeaseLost(self.cluster_id.clone()))
                }
            }
        }
    }

    // ── Waiting ────────────────────────────────────────────────────

    /// Await `fut` while renewing the lease and watching for cancellation.
    ///
    /// The renewal deadline belongs to the run, not to one wait, so a run
    /// made of many short waits still renews on schedule.
    pub(crate) async fn hold<T>(&self, fut: impl Future<Output = T>) -> RolloutResult<T> {
        let mut cancel = self.cancel.clone();
        if cancel.is_cancelled() {
            return Err(RolloutError::Cancelled(self.cluster_id.clone()));
        }
        if Instant::now() >= self.renew_due() {
            self.renew()?;
        }
        let mut fut = std::pin::pin!(fut);

        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = tokio::time::sleep_until(self.renew_due()) => self.renew()?,
                _ = cancel.cancelled() => {
                    return Err(RolloutError::Cancelled(self.cluster_id.clone()));
                }
            }
        }
    }

    fn renew_due(&self) -> Instant {
        self.started + Duration::from_millis(self.renew_due_ms.load(Ordering::Acquire))
    }

    fn renew(&self) -> RolloutResult<()> {
        let settings = &self.orch.settings;
        let renewed = self
            .orch
            .leases
            .renew_fenced(&self.cluster_id, &self.fence, settings.lease_ttl)?;
        if !renewed {
            error!(cluster_id = %self.cluster_id, "lease renewal failed, aborting");
            return Err(RolloutError::LeaseLost(self.cluster_id.clone()));
        }
        let next = self.started.elapsed() + settings.renew_interval;
        self.renew_due_ms.store(millis(next), Ordering::Release);
        Ok(())
    }

    /// Poll the merge signal with backoff until merged or the deadline passes.
    pub(crate) async fn wait_for_merge(&self, change_ref: &str) -> RolloutResult<MergeWait> {
        let settings = &self.orch.settings;
        let deadline = Instant::now() + settings.merge_timeout;
        let mut delay = settings.poll_interval;
        let mut failures = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(MergeWait::Pending);
            }
            let slice = settings.poll_interval.min(remaining);
            let changes = &self.orch.providers.changes;
            let signal = self
                .hold(bounded(slice, changes.await_merge_signal(change_ref, slice)))
                .await?;
            match signal {
                Ok(true) => {
                    info!(cluster_id = %self.cluster_id, %change_ref, "change merged");
                    return Ok(MergeWait::Merged);
                }
                Ok(false) => failures = 0,
                Err(e) if !e.is_retryable() => return Ok(MergeWait::Failed(e)),
                Err(e) => {
                    failures += 1;
                    warn!(cluster_id = %self.cluster_id, %change_ref, error = %e, failures, "merge signal poll failed");
                    if failures >= self.orch.retry.max_attempts.max(1) {
                        return Ok(MergeWait::Failed(e));
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(MergeWait::Pending);
            }
            debug!(cluster_id = %self.cluster_id, %change_ref, ?delay, "waiting for merge");
            self.hold(tokio::time::sleep(delay.min(remaining))).await?;
            delay = (delay * 2).min(settings.max_poll_interval);
        }
    }

    /// Wait for the cluster to converge on its desired state.
    pub(crate) async fn reconciled(
        &self,
        cluster: &Cluster,
    ) -> RolloutResult<Result<bool, ExternalError>> {
        let timeout = self.orch.settings.reconcile_timeout;
        let reconciler = &self.orch.providers.reconciler;
        self.hold(self.orch.retry.run("wait_reconciled", || {
            bounded(timeout, reconciler.wait_reconciled(cluster, timeout))
        }))
        .await
    }

    pub(crate) async fn snapshot(
        &self,
        cluster: &Cluster,
        length: Duration,
        operation: &str,
    ) -> RolloutResult<Result<MetricsSnapshot, ExternalError>> {
        let window = TimeWindow::ending_at(self.orch.store.now_ms() / 1000, length.as_secs());
        let metrics = &self.orch.providers.metrics;
        let names = &self.orch.settings.metrics;
        let result = self
            .hold(self.orch.retry.run(operation, || metrics.snapshot(cluster, window, names)))
            .await?;
        Ok(result.map(|snap| match snap.window {
            Some(_) => snap,
            None => snap.with_window(window),
        }))
    }

    pub(crate) fn event(&self, cluster: &Cluster, event: RolloutEvent, detail: Option<&str>) {
        self.orch.emit(
            event,
            json!({
                "cluster_id": cluster.cluster_id,
                "batch_id": cluster.batch_id,
                "environment": cluster.environment,
                "from_version": cluster.current_version,
                "target_version": self.target,
                "detail": detail,
            }),
        );
    }

    // ── Forward phases ─────────────────────────────────────────────

    async fn pre_check(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let prechecks = &self.orch.providers.prechecks;
        let result = self
            .hold(self.orch.retry.run("pre_check", || prechecks.run_checks(cluster)))
            .await?;

        let failure = match &result {
            Ok(checks) => {
                let failed: Vec<String> = checks
                    .iter()
                    .filter(|c| !c.passed)
                    .map(|c| format!("{}: {}", c.name, c.message))
                    .collect();
                (!failed.is_empty()).then(|| format!("pre-checks failed: {}", failed.join("; ")))
            }
            Err(e) => Some(format!("pre-check provider failed: {e}")),
        };

        match failure {
            None => {
                let checks = result.unwrap_or_default();
                info!(cluster_id = %self.cluster_id, checks = checks.len(), "pre-checks passed");
                self.advance(ClusterStatus::PreCheckRunning, ClusterStatus::PreCheckPassed, |c| {
                    c.pre_checks = checks
                })?;
                Ok(Step::Continue)
            }
            Some(reason) => {
                warn!(cluster_id = %self.cluster_id, %reason, "pre-checks failed");
                let stored = reason.clone();
                self.advance(ClusterStatus::PreCheckRunning, ClusterStatus::PreCheckFailed, |c| {
                    c.last_error = Some(stored)
                })?;
                self.event(cluster, RolloutEvent::PreCheckFailed, Some(&reason));
                Ok(Step::Done(ClusterOutcome::PreCheckFailed))
            }
        }
    }

    async fn propose(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let baseline = match self
            .snapshot(cluster, self.orch.settings.baseline_window, "baseline_snapshot")
            .await?
        {
            Ok(snapshot) => snapshot,
            Err(e) => return self.proposal_failed(cluster, &format!("baseline capture failed: {e}")),
        };
        self.orch.store.put_baseline(&self.cluster_id, &baseline)?;

        let report = ChangeReport::upgrade(cluster, &self.target, cluster.pre_checks.clone());
        let changes = &self.orch.providers.changes;
        let target = self.target.as_str();
        let proposed = self
            .hold(
                self.orch
                    .retry
                    .run("propose_change", || changes.propose_change(cluster, target, &report)),
            )
            .await?;

        match proposed {
            Ok(change_ref) => {
                info!(cluster_id = %self.cluster_id, %change_ref, "change proposed");
                let stored = change_ref.clone();
                self.advance(ClusterStatus::PreCheckPassed, ClusterStatus::ChangeProposed, |c| {
                    c.change_ref = Some(stored)
                })?;
                self.event(cluster, RolloutEvent::ProposalCreated, Some(&change_ref));
                Ok(Step::Continue)
            }
            Err(e) => self.proposal_failed(cluster, &format!("change proposal failed: {e}")),
        }
    }

    fn proposal_failed(&self, cluster: &Cluster, reason: &str) -> RolloutResult<Step> {
        warn!(cluster_id = %self.cluster_id, %reason, "proposal failed");
        let stored = reason.to_string();
        self.advance(ClusterStatus::PreCheckPassed, ClusterStatus::ProposalFailed, |c| {
            c.last_error = Some(stored)
        })?;
        self.event(cluster, RolloutEvent::ProposalFailed, Some(reason));
        Ok(Step::Done(ClusterOutcome::ProposalFailed))
    }

    async fn await_approval(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let Some(change_ref) = cluster.change_ref.clone() else {
            return Ok(Step::Done(ClusterOutcome::Failed(
                "awaiting approval without a change reference".into(),
            )));
        };

        match self.wait_for_merge(&change_ref).await? {
            MergeWait::Merged => {
                self.advance(ClusterStatus::AwaitingApproval, ClusterStatus::ChangeApplied, |c| {
                    c.last_error = None
                })?;
                Ok(Step::Continue)
            }
            MergeWait::Pending => {
                let message = format!(
                    "change {change_ref} not merged within {:?}",
                    self.orch.settings.merge_timeout
                );
                info!(cluster_id = %self.cluster_id, %message, "parked at approval gate");
                self.note(ClusterStatus::AwaitingApproval, &message)?;
                Ok(Step::Done(ClusterOutcome::AwaitingApproval))
            }
            MergeWait::Failed(e) => self.require_rollback(
                cluster,
                ClusterStatus::AwaitingApproval,
                &format!("merge signal for {change_ref} failed: {e}"),
                Vec::new(),
            ),
        }
    }

    async fn await_reconciled(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let timeout = self.orch.settings.reconcile_timeout;
        match self.reconciled(cluster).await? {
            Ok(true) => {
                let now = self.orch.store.now_ms();
                self.advance(ClusterStatus::ChangeApplied, ClusterStatus::Soaking, |c| {
                    c.soak_started_at_ms = Some(now)
                })?;
                info!(cluster_id = %self.cluster_id, soak = ?self.orch.settings.soak, "change reconciled, soaking");
                Ok(Step::Continue)
            }
            Ok(false) => self.require_rollback(
                cluster,
                ClusterStatus::ChangeApplied,
                &format!("cluster did not reconcile within {timeout:?}"),
                Vec::new(),
            ),
            Err(e) => self.require_rollback(
                cluster,
                ClusterStatus::ChangeApplied,
                &format!("reconciliation check failed: {e}"),
                Vec::new(),
            ),
        }
    }

    async fn soak(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let now = self.orch.store.now_ms();
        let started = cluster.soak_started_at_ms.unwrap_or(now);
        let elapsed = Duration::from_millis(now.saturating_sub(started));
        let remaining = self.orch.settings.soak.saturating_sub(elapsed);
        debug!(cluster_id = %self.cluster_id, ?remaining, "soak period");

        self.hold(tokio::time::sleep(remaining)).await?;
        self.advance(ClusterStatus::Soaking, ClusterStatus::Validating, |_| {})?;
        Ok(Step::Continue)
    }

    async fn validate(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let Some(baseline) = self.orch.store.get_baseline(&self.cluster_id)? else {
            return self.require_rollback(
                cluster,
                ClusterStatus::Validating,
                "no baseline snapshot recorded",
                Vec::new(),
            );
        };
        let current = match self
            .snapshot(cluster, self.orch.settings.current_window, "current_snapshot")
            .await?
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return self.require_rollback(
                    cluster,
                    ClusterStatus::Validating,
                    &format!("current snapshot failed: {e}"),
                    Vec::new(),
                );
            }
        };

        let result = self.orch.comparator.compare(&baseline, &current);
        if result.passed {
            let target = self.target.clone();
            let now = self.orch.store.now_ms();
            self.advance(ClusterStatus::Validating, ClusterStatus::Healthy, |c| {
                c.upgrade_history.push(UpgradeHistoryEntry {
                    from_version: c.current_version.clone(),
                    to_version: target.clone(),
                    outcome: UpgradeOutcome::Upgraded,
                    change_ref: c.change_ref.clone(),
                    at_ms: now,
                });
                c.previous_version = Some(std::mem::replace(&mut c.current_version, target));
                c.soak_started_at_ms = None;
                c.last_error = None;
            })?;
            info!(cluster_id = %self.cluster_id, version = %self.target, "cluster healthy");
            self.event(cluster, RolloutEvent::Healthy, None);
            return Ok(Step::Done(ClusterOutcome::Healthy));
        }

        let lines = result.report_lines();
        let reason = format!(
            "validation failed with {} violation(s):\n{}",
            lines.len(),
            lines.join("\n")
        );
        self.require_rollback(cluster, ClusterStatus::Validating, &reason, lines)
    }

    /// Enter the rollback branch from `from`.
    pub(crate) fn require_rollback(
        &mut self,
        cluster: &Cluster,
        from: ClusterStatus,
        reason: &str,
        violations: Vec<String>,
    ) -> RolloutResult<Step> {
        warn!(cluster_id = %self.cluster_id, %from, %reason, "rollback required");
        self.violations = violations;
        let stored = reason.to_string();
        self.advance(from, ClusterStatus::RollbackRequired, |c| {
            c.last_error = Some(stored)
        })?;
        self.event(cluster, RolloutEvent::RollbackRequired, Some(reason));
        Ok(Step::Continue)
    }
}
