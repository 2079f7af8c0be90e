//! Contracts for the external collaborators the orchestrator drives.
//!
//! Cloud, version-control, and monitoring glue lives outside this crate;
//! the orchestrator only sees these traits. All calls go through the
//! bounded retry policy, so implementations should fail fast with the
//! most specific [`ExternalError`] variant rather than retry internally.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use fleetguard_state::CheckResult;
use fleetguard_state::Cluster;
use fleetguard_validation::{MetricsSnapshot, TimeWindow};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExternalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upgrade,
    Rollback,
}

/// Context attached to a change proposal so reviewers can approve it
/// without looking anything up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub kind: ChangeKind,
    pub cluster_id: String,
    pub batch_id: String,
    pub environment: String,
    pub region: String,
    pub owner_team: Option<String>,
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    /// Why a rollback was needed.
    #[serde(default)]
    pub reason: Option<String>,
    /// One rendered line per comparator violation.
    #[serde(default)]
    pub violations: Vec<String>,
}

impl ChangeReport {
    pub fn upgrade(cluster: &Cluster, to_version: &str, checks: Vec<CheckResult>) -> Self {
        Self {
            kind: ChangeKind::Upgrade,
            cluster_id: cluster.cluster_id.clone(),
            batch_id: cluster.batch_id.clone(),
            environment: cluster.environment.clone(),
            region: cluster.region.clone(),
            owner_team: cluster.owner_team.clone(),
            from_version: cluster.current_version.clone(),
            to_version: to_version.to_string(),
            checks,
            reason: None,
            violations: Vec::new(),
        }
    }

    /// Short title suitable for a merge request.
    pub fn title(&self) -> String {
        match self.kind {
            ChangeKind::Upgrade => format!(
                "Upgrade {} ({}) {} -> {}",
                self.cluster_id, self.batch_id, self.from_version, self.to_version
            ),
            ChangeKind::Rollback => format!(
                "Rollback {} ({}) {} -> {}",
                self.cluster_id, self.batch_id, self.from_version, self.to_version
            ),
        }
    }
}

impl fmt::Display for ChangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "## {}", self.title())?;
        writeln!(f)?;
        writeln!(f, "- cluster: {}", self.cluster_id)?;
        writeln!(f, "- batch: {}", self.batch_id)?;
        writeln!(f, "- environment: {} / {}", self.environment, self.region)?;
        if let Some(team) = &self.owner_team {
            writeln!(f, "- owner: {team}")?;
        }
        if let Some(reason) = &self.reason {
            writeln!(f)?;
            writeln!(f, "### Reason")?;
            writeln!(f, "{reason}")?;
        }
        if !self.violations.is_empty() {
            writeln!(f)?;
            writeln!(f, "### Violations")?;
            for line in &self.violations {
                writeln!(f, "- {line}")?;
            }
        }
        if !self.checks.is_empty() {
            writeln!(f)?;
            writeln!(f, "### Pre-checks")?;
            for check in &self.checks {
                let mark = if check.passed { "pass" } else { "FAIL" };
                writeln!(f, "- [{mark}] {}: {}", check.name, check.message)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait PreCheckProvider: Send + Sync {
    async fn run_checks(&self, cluster: &Cluster) -> Result<Vec<CheckResult>, ExternalError>;
}

#[async_trait]
pub trait ChangeProvider: Send + Sync {
    /// Open a change proposal and return its reference.
    async fn propose_change(
        &self,
        cluster: &Cluster,
        version: &str,
        report: &ChangeReport,
    ) -> Result<String, ExternalError>;

    /// Wait up to `timeout` for the change to be merged.
    async fn await_merge_signal(
        &self,
        change_ref: &str,
        timeout: Duration,
    ) -> Result<bool, ExternalError>;
}

#[async_trait]
pub trait ReconciliationProvider: Send + Sync {
    /// Wait up to `timeout` for the cluster to converge on the merged config.
    async fn wait_reconciled(&self, cluster: &Cluster, timeout: Duration)
    -> Result<bool, ExternalError>;
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn snapshot(
        &self,
        cluster: &Cluster,
        window: TimeWindow,
        metric_names: &[String],
    ) -> Result<MetricsSnapshot, ExternalError>;
}

/// Rollout events published to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutEvent {
    BatchStarted,
    BatchFinished,
    PreCheckFailed,
    ProposalCreated,
    ProposalFailed,
    Healthy,
    RollbackRequired,
    RollbackProposed,
    RolledBack,
    RollbackFailed,
    Cancelled,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        event: RolloutEvent,
        payload: serde_json::Value,
    ) -> Result<(), ExternalError>;
}

/// Notifier that only writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        event: RolloutEvent,
        payload: serde_json::Value,
    ) -> Result<(), ExternalError> {
        info!(?event, %payload, "rollout event");
        Ok(())
    }
}

/// The full set of collaborators handed to the orchestrator.
#[derive(Clone)]
pub struct Providers {
    pub prechecks: Arc<dyn PreCheckProvider>,
    pub changes: Arc<dyn ChangeProvider>,
    pub reconciler: Arc<dyn ReconciliationProvider>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub notifier: Arc<dyn Notifier>,
}
