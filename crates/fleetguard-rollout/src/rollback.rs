//! Rollback branch of the status machine.
//!
//! Reverting is itself a reviewed change: the coordinator proposes a
//! change back to the version the cluster ran before the upgrade, waits
//! for it to merge and reconcile, and only then marks the cluster
//! `failed_rolled_back`. Nothing here rewrites cluster config directly.
//!
//! A revert that cannot be proposed, merged or reconciled stops in
//! `rollback_failed` and waits for an operator.

use std::time::Duration;

use fleetguard_state::{
    Cluster, ClusterStatus, LeaseManager, StateError, StateStore, TransitionOutcome,
    UpgradeHistoryEntry, UpgradeOutcome,
};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::error::{RolloutError, RolloutResult};
use crate::orchestrator::{ClusterOutcome, ClusterRun, MergeWait, Orchestrator, Step};
use crate::providers::{ChangeKind, ChangeReport, RolloutEvent};

/// Result of [`RollbackCoordinator::mark`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackMark {
    /// Now `rollback_required`; the next run proposes the revert.
    Marked,
    /// Nothing to roll back from this status.
    Ineligible(ClusterStatus),
    /// Another operator holds the cluster.
    Contended,
}

/// Builds revert proposals.
pub struct RollbackCoordinator;

impl RollbackCoordinator {
    /// Statuses an operator may roll back from: a change awaiting review
    /// or already merged, or a revert that stalled.
    pub fn can_roll_back(status: ClusterStatus) -> bool {
        status.is_post_merge()
            || matches!(
                status,
                ClusterStatus::AwaitingApproval | ClusterStatus::RollbackFailed
            )
    }

    /// Move a cluster into `rollback_required` under a short lease without
    /// proposing anything. Used where no change provider is available.
    pub fn mark(
        store: &StateStore,
        holder: &str,
        ttl: Duration,
        cluster_id: &str,
        reason: &str,
    ) -> RolloutResult<RollbackMark> {
        let cluster = store.get(cluster_id)?;
        if !Self::can_roll_back(cluster.status) {
            return Ok(RollbackMark::Ineligible(cluster.status));
        }
        let leases = LeaseManager::new(store.clone());
        let Some(lease) = leases.acquire_fenced(cluster_id, holder, ttl)? else {
            return Ok(RollbackMark::Contended);
        };
        let message = format!("manual rollback: {reason}");
        let outcome = store.transition_with(
            cluster_id,
            cluster.status,
            ClusterStatus::RollbackRequired,
            Some(&lease.fence()),
            |c| c.last_error = Some(message),
        );
        if let Err(e) = leases.release(cluster_id, holder) {
            warn!(%cluster_id, error = %e, "lease release failed");
        }
        match outcome? {
            TransitionOutcome::Applied(_) => {
                warn!(%cluster_id, %reason, "cluster marked for rollback");
                Ok(RollbackMark::Marked)
            }
            TransitionOutcome::Fenced | TransitionOutcome::Conflict { .. } => {
                Ok(RollbackMark::Contended)
            }
        }
    }

    /// Version a cluster returns to. The record's `current_version` only
    /// moves on a successful upgrade, so it still names the pre-upgrade
    /// version while a rollback is in flight.
    pub fn revert_target(cluster: &Cluster) -> &str {
        &cluster.current_version
    }

    pub fn report(cluster: &Cluster, violations: Vec<String>) -> ChangeReport {
        ChangeReport {
            kind: ChangeKind::Rollback,
            cluster_id: cluster.cluster_id.clone(),
            batch_id: cluster.batch_id.clone(),
            environment: cluster.environment.clone(),
            region: cluster.region.clone(),
            owner_team: cluster.owner_team.clone(),
            from_version: cluster
                .target_version
                .clone()
                .unwrap_or_else(|| cluster.current_version.clone()),
            to_version: Self::revert_target(cluster).to_string(),
            checks: Vec::new(),
            reason: cluster.last_error.clone(),
            violations,
        }
    }
}

impl ClusterRun<'_> {
    pub(crate) async fn rollback_step(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        match cluster.status {
            ClusterStatus::RollbackRequired => self.propose_rollback(cluster).await,
            ClusterStatus::RollbackProposed => {
                self.advance(
                    ClusterStatus::RollbackProposed,
                    ClusterStatus::AwaitingRollbackApproval,
                    |_| {},
                )?;
                Ok(Step::Continue)
            }
            ClusterStatus::AwaitingRollbackApproval => self.await_rollback(cluster).await,
            other => Ok(Step::Done(ClusterOutcome::Failed(format!(
                "{other} is not a rollback status"
            )))),
        }
    }

    async fn propose_rollback(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let report = RollbackCoordinator::report(cluster, std::mem::take(&mut self.violations));
        let version = RollbackCoordinator::revert_target(cluster);
        let changes = &self.orch.providers.changes;
        let proposed = self
            .hold(
                self.orch
                    .retry
                    .run("propose_rollback", || changes.propose_change(cluster, version, &report)),
            )
            .await?;

        match proposed {
            Ok(rollback_ref) => {
                info!(cluster_id = %self.cluster_id, %rollback_ref, to = %version, "rollback proposed");
                let stored = rollback_ref.clone();
                self.advance(
                    ClusterStatus::RollbackRequired,
                    ClusterStatus::RollbackProposed,
                    |c| c.rollback_ref = Some(stored),
                )?;
                self.event(cluster, RolloutEvent::RollbackProposed, Some(&rollback_ref));
                Ok(Step::Continue)
            }
            Err(e) => self.rollback_failed(
                cluster,
                ClusterStatus::RollbackRequired,
                &format!("rollback proposal failed: {e}"),
            ),
        }
    }

    async fn await_rollback(&mut self, cluster: &Cluster) -> RolloutResult<Step> {
        let Some(rollback_ref) = cluster.rollback_ref.clone() else {
            return Ok(Step::Done(ClusterOutcome::Failed(
                "awaiting rollback approval without a change reference".into(),
            )));
        };

        match self.wait_for_merge(&rollback_ref).await? {
            MergeWait::Merged => {}
            MergeWait::Pending => {
                info!(cluster_id = %self.cluster_id, %rollback_ref, "parked at rollback approval gate");
                return Ok(Step::Done(ClusterOutcome::AwaitingRollbackApproval));
            }
            MergeWait::Failed(e) => {
                return self.rollback_failed(
                    cluster,
                    ClusterStatus::AwaitingRollbackApproval,
                    &format!("merge signal for {rollback_ref} failed: {e}"),
                );
            }
        }

        let failure = match self.reconciled(cluster).await? {
            Ok(true) => None,
            Ok(false) => Some(format!(
                "rollback did not reconcile within {:?}",
                self.orch.settings.reconcile_timeout
            )),
            Err(e) => Some(format!("rollback reconciliation check failed: {e}")),
        };
        if let Some(reason) = failure {
            return self.rollback_failed(cluster, ClusterStatus::AwaitingRollbackApproval, &reason);
        }

        let now = self.orch.store.now_ms();
        self.advance(
            ClusterStatus::AwaitingRollbackApproval,
            ClusterStatus::FailedRolledBack,
            |c| {
                let from = c
                    .target_version
                    .clone()
                    .unwrap_or_else(|| c.current_version.clone());
                c.upgrade_history.push(UpgradeHistoryEntry {
                    from_version: from,
                    to_version: c.current_version.clone(),
                    outcome: UpgradeOutcome::RolledBack,
                    change_ref: c.rollback_ref.clone(),
                    at_ms: now,
                });
                c.soak_started_at_ms = None;
            },
        )?;
        warn!(cluster_id = %self.cluster_id, version = %cluster.current_version, "cluster rolled back");
        self.event(cluster, RolloutEvent::RolledBack, cluster.last_error.as_deref());
        Ok(Step::Done(ClusterOutcome::RolledBack))
    }

    /// Park the cluster in `rollback_failed` until an operator intervenes.
    fn rollback_failed(
        &self,
        cluster: &Cluster,
        from: ClusterStatus,
        reason: &str,
    ) -> RolloutResult<Step> {
        error!(cluster_id = %self.cluster_id, %from, %reason, "rollback stalled");
        let stored = reason.to_string();
        self.advance(from, ClusterStatus::RollbackFailed, |c| {
            c.last_error = Some(stored)
        })?;
        self.event(cluster, RolloutEvent::RollbackFailed, Some(reason));
        Ok(Step::Done(ClusterOutcome::RollbackFailed))
    }
}

impl Orchestrator {
    /// Operator-initiated rollback of a cluster whose change is awaiting
    /// approval or already merged, or whose earlier revert stalled. Runs
    /// the rollback branch to completion or to the rollback approval gate.
    pub async fn manual_rollback(&self, cluster_id: &str, reason: &str) -> RolloutResult<ClusterOutcome> {
        self.rollback_cluster(cluster_id, reason, CancelToken::never())
            .await
    }

    pub(crate) async fn rollback_cluster(
        &self,
        cluster_id: &str,
        reason: &str,
        cancel: CancelToken,
    ) -> RolloutResult<ClusterOutcome> {
        let cluster = self.store.get(cluster_id)?;
        if !RollbackCoordinator::can_roll_back(cluster.status) {
            return Err(StateError::InvalidTransition {
                from: cluster.status,
                to: ClusterStatus::RollbackRequired,
            }
            .into());
        }
        let Some(target) = cluster.target_version.clone() else {
            return Err(RolloutError::NotFound(format!(
                "target version of {cluster_id}"
            )));
        };

        let Some(lease) =
            self.leases
                .acquire_fenced(cluster_id, self.operator_id(), self.settings.lease_ttl)?
        else {
            return Ok(ClusterOutcome::Contended);
        };
        warn!(%cluster_id, %reason, "manual rollback requested");

        let mut run = ClusterRun::new(self, cluster_id, &target, lease.fence(), cancel);
        let result = match run.require_rollback(
            &cluster,
            cluster.status,
            &format!("manual rollback: {reason}"),
            Vec::new(),
        ) {
            Ok(_) => run.drive().await,
            Err(e) => Err(e),
        };
        self.finish_run(&run, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reverts_target_to_current() {
        let mut cluster = Cluster::new("c1", "prod", "production", "eu-west-1", "1.20.0");
        cluster.target_version = Some("1.21.0".into());
        cluster.last_error = Some("validation failed with 1 violation(s)".into());

        let report = RollbackCoordinator::report(&cluster, vec!["error_rate increased".into()]);
        assert_eq!(report.kind, ChangeKind::Rollback);
        assert_eq!(report.from_version, "1.21.0");
        assert_eq!(report.to_version, "1.20.0");
        assert_eq!(report.title(), "Rollback c1 (prod) 1.21.0 -> 1.20.0");
        assert!(report.to_string().contains("- error_rate increased"));
        assert_eq!(report.reason.as_deref(), Some("validation failed with 1 violation(s)"));
    }

    fn record_at(store: &StateStore, path: &[ClusterStatus]) {
        store
            .register(Cluster::new("c1", "prod", "production", "eu-west-1", "1.20.0"))
            .unwrap();
        for pair in path.windows(2) {
            store.transition("c1", pair[0], pair[1]).unwrap();
        }
    }

    #[test]
    fn mark_moves_merged_change_into_rollback() {
        let store = StateStore::open_in_memory().unwrap();
        record_at(
            &store,
            &[
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                ClusterStatus::PreCheckPassed,
                ClusterStatus::ChangeProposed,
                ClusterStatus::AwaitingApproval,
                ClusterStatus::ChangeApplied,
                ClusterStatus::Soaking,
            ],
        );

        let mark = RollbackCoordinator::mark(&store, "cli", Duration::from_secs(60), "c1", "p99 spike")
            .unwrap();
        assert_eq!(mark, RollbackMark::Marked);
        let cluster = store.get("c1").unwrap();
        assert_eq!(cluster.status, ClusterStatus::RollbackRequired);
        assert_eq!(cluster.last_error.as_deref(), Some("manual rollback: p99 spike"));
        assert!(LeaseManager::new(store).current("c1").unwrap().is_none());
    }

    #[test]
    fn mark_skips_clusters_without_a_change() {
        let store = StateStore::open_in_memory().unwrap();
        record_at(&store, &[ClusterStatus::Pending]);
        let mark = RollbackCoordinator::mark(&store, "cli", Duration::from_secs(60), "c1", "x")
            .unwrap();
        assert_eq!(mark, RollbackMark::Ineligible(ClusterStatus::Pending));
        assert_eq!(store.get("c1").unwrap().status, ClusterStatus::Pending);
    }

    #[test]
    fn mark_respects_a_live_lease() {
        let store = StateStore::open_in_memory().unwrap();
        record_at(
            &store,
            &[
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                ClusterStatus::PreCheckPassed,
                ClusterStatus::ChangeProposed,
                ClusterStatus::AwaitingApproval,
            ],
        );
        let leases = LeaseManager::new(store.clone());
        assert!(leases.acquire("c1", "op-a", Duration::from_secs(300)).unwrap());

        let mark = RollbackCoordinator::mark(&store, "cli", Duration::from_secs(60), "c1", "x")
            .unwrap();
        assert_eq!(mark, RollbackMark::Contended);
        assert!(leases.is_held_by("c1", "op-a").unwrap());
        assert_eq!(store.get("c1").unwrap().status, ClusterStatus::AwaitingApproval);
    }
}
