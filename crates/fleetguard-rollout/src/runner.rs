//! Batch fan-out.
//!
//! `start_batch` gates on the dependency resolver, then drives every
//! member of the batch through the orchestrator on a background task,
//! at most `parallelism` clusters at a time. `rollback_batch` fans a
//! manual rollback out the same way.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use fleetguard_state::{Cluster, StateError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelRegistry, CancelToken};
use crate::config::ConfigError;
use crate::error::{RolloutError, RolloutResult};
use crate::orchestrator::{ClusterOutcome, Orchestrator, settle};
use crate::providers::RolloutEvent;
use crate::resolver::DependencyResolver;

pub type RunId = Uuid;

/// Per-cluster outcomes of one batch run, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: RunId,
    pub batch_id: String,
    pub target_version: String,
    pub outcomes: Vec<(String, ClusterOutcome)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Every cluster ended at the target version.
    pub fn all_healthy(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_success())
    }

    pub fn outcome(&self, cluster_id: &str) -> Option<&ClusterOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == cluster_id)
            .map(|(_, o)| o)
    }
}

/// Per-cluster outcomes of a batch rollback, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub batch_id: String,
    pub reason: String,
    /// `skipped` marks clusters that had nothing to roll back.
    pub outcomes: Vec<(String, ClusterOutcome)>,
}

impl RollbackReport {
    pub fn rolled_back(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == ClusterOutcome::RolledBack)
            .count()
    }

    pub fn outcome(&self, cluster_id: &str) -> Option<&ClusterOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == cluster_id)
            .map(|(_, o)| o)
    }
}

type RunHandle = JoinHandle<RolloutResult<BatchReport>>;

/// Entry point for operators: start, watch, and cancel batch rollouts.
#[derive(Clone)]
pub struct BatchRunner {
    orchestrator: Arc<Orchestrator>,
    resolver: Arc<DependencyResolver>,
    cancels: CancelRegistry,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
}

impl BatchRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, resolver: Arc<DependencyResolver>) -> Self {
        Self {
            orchestrator,
            resolver,
            cancels: CancelRegistry::new(),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    /// Start rolling `batch_id` to `target_version` in the background.
    ///
    /// Fails up front if the batch is unknown, the version is not semver,
    /// or a prerequisite batch is not fully healthy.
    pub async fn start_batch(&self, batch_id: &str, target_version: &str) -> RolloutResult<RunId> {
        if self.resolver.batch(batch_id).is_none() {
            return Err(RolloutError::NotFound(format!("batch {batch_id}")));
        }
        semver::Version::parse(target_version).map_err(|e| {
            ConfigError::Invalid(format!("target version {target_version:?} is not semver: {e}"))
        })?;

        let readiness = self
            .resolver
            .can_proceed(batch_id, self.orchestrator.store())?;
        if !readiness.proceed {
            warn!(batch = %batch_id, reason = %readiness.reason, "batch blocked");
            return Err(RolloutError::PrerequisitesUnmet {
                batch: batch_id.to_string(),
                reason: readiness.reason,
            });
        }

        let members = self
            .resolver
            .members(batch_id, self.orchestrator.store())?;
        let run_id = Uuid::new_v4();
        info!(%run_id, batch = %batch_id, version = %target_version, clusters = members.len(), "batch started");

        let handle = tokio::spawn(fan_out(
            self.orchestrator.clone(),
            self.cancels.clone(),
            run_id,
            batch_id.to_string(),
            target_version.to_string(),
            members,
        ));
        self.runs.write().await.insert(run_id, handle);
        Ok(run_id)
    }

    /// Start a batch and wait for its report.
    pub async fn run_batch(&self, batch_id: &str, target_version: &str) -> RolloutResult<BatchReport> {
        let run_id = self.start_batch(batch_id, target_version).await?;
        self.wait_run(run_id).await
    }

    /// Wait for a started run to finish.
    pub async fn wait_run(&self, run_id: RunId) -> RolloutResult<BatchReport> {
        let handle = self
            .runs
            .write()
            .await
            .remove(&run_id)
            .ok_or_else(|| RolloutError::NotFound(format!("run {run_id}")))?;
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(%run_id, error = %e, "batch task ended abnormally");
                Err(RolloutError::Cancelled(format!("run {run_id}: {e}")))
            }
        }
    }

    /// Runs started and not yet waited on.
    pub async fn active_runs(&self) -> Vec<RunId> {
        let runs = self.runs.read().await;
        runs.iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Roll back every member of `batch_id` that has a change awaiting
    /// review, merged, or a stalled revert. Waits for each rollback to
    /// finish or park at its approval gate.
    pub async fn rollback_batch(&self, batch_id: &str, reason: &str) -> RolloutResult<RollbackReport> {
        if self.resolver.batch(batch_id).is_none() {
            return Err(RolloutError::NotFound(format!("batch {batch_id}")));
        }
        let members = self
            .resolver
            .members(batch_id, self.orchestrator.store())?;
        warn!(batch = %batch_id, %reason, clusters = members.len(), "batch rollback requested");

        let why = reason.to_string();
        let outcomes = run_bounded(
            self.orchestrator.clone(),
            self.cancels.clone(),
            &members,
            move |orchestrator, cluster_id, cancel| {
                let why = why.clone();
                async move {
                    match orchestrator.rollback_cluster(&cluster_id, &why, cancel).await {
                        Err(RolloutError::State(StateError::InvalidTransition { from, .. })) => {
                            info!(%cluster_id, status = %from, "nothing to roll back");
                            ClusterOutcome::Skipped
                        }
                        result => settle(&cluster_id, result),
                    }
                }
            },
        )
        .await;

        let report = RollbackReport {
            batch_id: batch_id.to_string(),
            reason: reason.to_string(),
            outcomes,
        };
        info!(batch = %batch_id, rolled_back = report.rolled_back(), "batch rollback finished");
        Ok(report)
    }

    pub fn get_status(&self, cluster_id: &str) -> RolloutResult<Cluster> {
        Ok(self.orchestrator.store().get(cluster_id)?)
    }

    /// Cancel the in-flight run of a cluster. The record keeps its last
    /// durable status. Returns `false` if nothing is running for it.
    pub async fn cancel(&self, cluster_id: &str) -> bool {
        self.cancels.cancel(cluster_id).await
    }
}

async fn fan_out(
    orchestrator: Arc<Orchestrator>,
    cancels: CancelRegistry,
    run_id: RunId,
    batch_id: String,
    target_version: String,
    members: Vec<String>,
) -> RolloutResult<BatchReport> {
    orchestrator.emit(
        RolloutEvent::BatchStarted,
        json!({
            "run_id": run_id,
            "batch_id": batch_id,
            "target_version": target_version,
            "clusters": members,
        }),
    );

    let target = target_version.clone();
    let outcomes = run_bounded(
        orchestrator.clone(),
        cancels,
        &members,
        move |orchestrator, cluster_id, cancel| {
            let target = target.clone();
            async move { orchestrator.run_cluster(&cluster_id, &target, cancel).await }
        },
    )
    .await;

    let report = BatchReport {
        run_id,
        batch_id,
        target_version,
        outcomes,
    };
    info!(
        %run_id,
        batch = %report.batch_id,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "batch finished"
    );
    orchestrator.emit(
        RolloutEvent::BatchFinished,
        json!({
            "run_id": run_id,
            "batch_id": report.batch_id,
            "target_version": report.target_version,
            "outcomes": report
                .outcomes
                .iter()
                .map(|(id, o)| (id.clone(), o.label()))
                .collect::<HashMap<_, _>>(),
        }),
    );
    Ok(report)
}

/// Run `job` for every member, at most `parallelism` at a time, with each
/// cluster registered for cancellation while its job runs.
async fn run_bounded<F, Fut>(
    orchestrator: Arc<Orchestrator>,
    cancels: CancelRegistry,
    members: &[String],
    job: F,
) -> Vec<(String, ClusterOutcome)>
where
    F: Fn(Arc<Orchestrator>, String, CancelToken) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ClusterOutcome> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(orchestrator.settings().parallelism.max(1)));
    let mut tasks = Vec::with_capacity(members.len());
    for cluster_id in members {
        let orchestrator = orchestrator.clone();
        let cancels = cancels.clone();
        let permits = permits.clone();
        let cluster_id = cluster_id.clone();
        let job = job.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return ClusterOutcome::Cancelled,
            };
            let token = cancels.register(&cluster_id).await;
            let outcome = job(orchestrator, cluster_id.clone(), token).await;
            cancels.release(&cluster_id).await;
            outcome
        }));
    }

    let mut outcomes = Vec::with_capacity(members.len());
    for (cluster_id, task) in members.iter().zip(tasks) {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => ClusterOutcome::Failed(format!("cluster task panicked: {e}")),
        };
        outcomes.push((cluster_id.clone(), outcome));
    }
    outcomes
}
