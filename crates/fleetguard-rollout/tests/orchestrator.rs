//! Cluster runs against scripted providers.
//!
//! Time is paused, so soak periods and merge polling complete instantly.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use fleetguard_rollout::{
    CancelHandle, CancelToken, ChangeKind, CheckResult, ClusterOutcome, ExternalError,
    Orchestrator, OrchestratorSettings, RetryPolicy, RolloutError, RolloutEvent,
};
use fleetguard_state::{
    ClusterStatus, LeaseManager, StateError, StateStore, UpgradeOutcome,
};

fn orchestrator(store: &StateStore, harness: &Harness) -> Orchestrator {
    Orchestrator::new(store.clone(), harness.providers(), settings(), thresholds())
}

#[tokio::test(start_paused = true)]
async fn upgrade_reaches_healthy() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::Healthy);

    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::Healthy);
    assert_eq!(cluster.current_version, "1.21.0");
    assert_eq!(cluster.previous_version.as_deref(), Some("1.20.0"));
    assert_eq!(cluster.change_ref.as_deref(), Some("mr-1"));
    assert_eq!(cluster.upgrade_history.len(), 1);
    assert_eq!(cluster.upgrade_history[0].outcome, UpgradeOutcome::Upgraded);
    assert!(store.get_baseline("c1").unwrap().is_some());

    let proposals = harness.proposals();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].1, "1.21.0");
    assert_eq!(proposals[0].2.kind, ChangeKind::Upgrade);
    assert_eq!(proposals[0].2.checks.len(), 2);

    assert!(LeaseManager::new(store.clone()).current("c1").unwrap().is_none());
    assert!(harness.notifier.wait_for(RolloutEvent::Healthy).await);
}

#[tokio::test(start_paused = true)]
async fn failed_pre_check_stops_before_proposal() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness
        .prechecks
        .checks
        .lock()
        .unwrap()
        .push(CheckResult::fail("pdb_healthy", "2 pods unavailable"));
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::PreCheckFailed);

    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::PreCheckFailed);
    assert!(cluster.last_error.unwrap().contains("pdb_healthy"));
    assert_eq!(cluster.current_version, "1.20.0");
    assert!(harness.proposals().is_empty());
    assert!(harness.notifier.wait_for(RolloutEvent::PreCheckFailed).await);
}

#[tokio::test(start_paused = true)]
async fn proposal_failure_is_retried_then_terminal() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    *harness.changes.propose_error.lock().unwrap() =
        Some(ExternalError::Unavailable("gitlab 503".into()));
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::ProposalFailed);
    assert_eq!(harness.changes.propose_calls.load(Ordering::SeqCst), 3);

    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::ProposalFailed);
    assert!(cluster.last_error.unwrap().contains("gitlab 503"));
}

#[tokio::test(start_paused = true)]
async fn rejected_proposal_is_not_retried() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    *harness.changes.propose_error.lock().unwrap() =
        Some(ExternalError::Rejected("branch protected".into()));
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::ProposalFailed);
    assert_eq!(harness.changes.propose_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn regression_rolls_back_through_reviewed_change() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    *harness.metrics.current.lock().unwrap() = degraded_metrics();
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::RolledBack);

    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::FailedRolledBack);
    assert_eq!(cluster.current_version, "1.20.0");
    assert_eq!(cluster.rollback_ref.as_deref(), Some("mr-2"));
    assert!(cluster.last_error.unwrap().starts_with("validation failed with 1 violation(s)"));
    let last = cluster.upgrade_history.last().unwrap();
    assert_eq!(last.outcome, UpgradeOutcome::RolledBack);
    assert_eq!(last.from_version, "1.21.0");
    assert_eq!(last.to_version, "1.20.0");

    let proposals = harness.proposals();
    assert_eq!(proposals.len(), 2);
    let (_, version, report) = &proposals[1];
    assert_eq!(version, "1.20.0");
    assert_eq!(report.kind, ChangeKind::Rollback);
    assert_eq!(report.violations.len(), 1);
    assert!(report.violations[0].contains("latency.p95"));

    assert!(harness.notifier.wait_for(RolloutEvent::RolledBack).await);
}

#[tokio::test(start_paused = true)]
async fn failed_reconciliation_requires_rollback() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness.reconciler.converges.store(false, Ordering::SeqCst);
    let orch = orchestrator(&store, &harness);

    // The revert cannot reconcile either, so the rollback stalls.
    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::RollbackFailed);
    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::RollbackFailed);
    assert!(cluster.last_error.unwrap().contains("rollback did not reconcile"));
    assert!(LeaseManager::new(store.clone()).current("c1").unwrap().is_none());
    assert!(harness.notifier.wait_for(RolloutEvent::RollbackFailed).await);

    // A plain rerun does not touch a stalled rollback.
    harness.reconciler.converges.store(true, Ordering::SeqCst);
    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::RollbackFailed);
    assert_eq!(harness.proposals().len(), 2);

    let outcome = orch.manual_rollback("c1", "revert by hand").await.unwrap();
    assert_eq!(outcome, ClusterOutcome::RolledBack);
    assert_eq!(store.get("c1").unwrap().status, ClusterStatus::FailedRolledBack);
    assert_eq!(harness.proposals().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn merge_signal_outage_ends_in_rollback_failed() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    *harness.changes.merge_error.lock().unwrap() =
        Some(ExternalError::Unavailable("gitlab 502".into()));
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::RollbackFailed);

    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::RollbackFailed);
    assert!(cluster.last_error.unwrap().contains("merge signal for mr-2 failed"));
    assert!(LeaseManager::new(store.clone()).current("c1").unwrap().is_none());

    // The exhausted upgrade gate entered the rollback branch with its reason.
    let proposals = harness.proposals();
    assert_eq!(proposals.len(), 2);
    assert_eq!(proposals[1].2.kind, ChangeKind::Rollback);
    assert!(
        proposals[1]
            .2
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("merge signal for mr-1 failed"))
    );

    *harness.changes.merge_error.lock().unwrap() = None;
    let outcome = orch.manual_rollback("c1", "signal restored").await.unwrap();
    assert_eq!(outcome, ClusterOutcome::RolledBack);
}

#[tokio::test(start_paused = true)]
async fn resume_after_pre_check_quotes_stored_checks() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    store
        .transition_with("c1", ClusterStatus::Pending, ClusterStatus::PreCheckRunning, None, |c| {
            c.target_version = Some("1.21.0".into())
        })
        .unwrap();
    store
        .transition_with(
            "c1",
            ClusterStatus::PreCheckRunning,
            ClusterStatus::PreCheckPassed,
            None,
            |c| c.pre_checks = vec![CheckResult::pass("nodes_ready", "3/3 nodes ready")],
        )
        .unwrap();

    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);
    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::Healthy);

    assert_eq!(harness.prechecks.calls.load(Ordering::SeqCst), 0);
    let proposals = harness.proposals();
    assert_eq!(
        proposals[0].2.checks,
        vec![CheckResult::pass("nodes_ready", "3/3 nodes ready")]
    );
}

#[tokio::test(start_paused = true)]
async fn hung_reconciler_is_cut_off_at_deadline() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness.reconciler.hangs.store(true, Ordering::SeqCst);
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::RollbackFailed);
    let cluster = store.get("c1").unwrap();
    assert!(cluster.last_error.unwrap().contains("rollback did not reconcile"));
    assert_eq!(harness.proposals().len(), 2);
}

fn short_lease_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        lease_ttl: Duration::from_secs(300),
        renew_interval: Duration::from_secs(100),
        poll_interval: Duration::from_secs(10),
        max_poll_interval: Duration::from_secs(10),
        merge_timeout: Duration::from_secs(30 * 60),
        ..settings()
    }
}

#[tokio::test(start_paused = true)]
async fn short_polls_keep_lease_alive() {
    let store = store_with(&[("c1", "canary", "1.20.0")]).with_clock(Arc::new(TokioClock::new()));
    let harness = Harness::new();
    harness.changes.merged.store(false, Ordering::SeqCst);
    let orch = Arc::new(Orchestrator::new(
        store.clone(),
        harness.providers(),
        short_lease_settings(),
        thresholds(),
    ));

    let task = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_cluster("c1", "1.21.0", CancelToken::never()).await })
    };
    // Well past one TTL, made only of 10s polls.
    tokio::time::sleep(Duration::from_secs(400)).await;

    let leases = LeaseManager::new(store.clone());
    assert!(leases.is_held_by("c1", "op-test").unwrap());
    assert!(!leases.acquire("c1", "op-other", Duration::from_secs(300)).unwrap());

    harness.changes.merged.store(true, Ordering::SeqCst);
    assert_eq!(task.await.unwrap(), ClusterOutcome::Healthy);
}

#[tokio::test(start_paused = true)]
async fn long_soak_keeps_lease_alive() {
    let store = store_with(&[("c1", "canary", "1.20.0")]).with_clock(Arc::new(TokioClock::new()));
    let harness = Harness::new();
    let settings = OrchestratorSettings {
        soak: Duration::from_secs(20 * 60),
        ..short_lease_settings()
    };
    let orch = Arc::new(Orchestrator::new(
        store.clone(),
        harness.providers(),
        settings,
        thresholds(),
    ));

    let task = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_cluster("c1", "1.21.0", CancelToken::never()).await })
    };
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;

    assert_eq!(store.get("c1").unwrap().status, ClusterStatus::Soaking);
    let leases = LeaseManager::new(store.clone());
    assert!(leases.is_held_by("c1", "op-test").unwrap());
    assert!(!leases.acquire("c1", "op-other", Duration::from_secs(300)).unwrap());

    assert_eq!(task.await.unwrap(), ClusterOutcome::Healthy);
}

#[tokio::test(start_paused = true)]
async fn unmerged_change_parks_then_resumes() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness.changes.merged.store(false, Ordering::SeqCst);
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::AwaitingApproval);
    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::AwaitingApproval);
    assert!(cluster.last_error.unwrap().contains("not merged"));

    harness.changes.merged.store(true, Ordering::SeqCst);
    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::Healthy);
    assert_eq!(harness.proposals().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_from_durable_status() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    store.put_baseline("c1", &healthy_metrics()).unwrap();

    // A previous operator got as far as soaking before it died.
    let path = [
        ClusterStatus::Pending,
        ClusterStatus::PreCheckRunning,
        ClusterStatus::PreCheckPassed,
        ClusterStatus::ChangeProposed,
        ClusterStatus::AwaitingApproval,
        ClusterStatus::ChangeApplied,
        ClusterStatus::Soaking,
    ];
    for edge in path.windows(2) {
        store
            .transition_with("c1", edge[0], edge[1], None, |c| {
                c.target_version = Some("1.21.0".into());
                c.change_ref = Some("mr-41".into());
            })
            .unwrap();
    }

    let harness = Harness::new();
    // Skip the baseline answer; only the current snapshot is requested.
    harness.metrics.skip_baseline("c1");
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::Healthy);
    assert_eq!(harness.prechecks.calls.load(Ordering::SeqCst), 0);
    assert!(harness.proposals().is_empty());
    assert_eq!(store.get("c1").unwrap().current_version, "1.21.0");
}

#[tokio::test(start_paused = true)]
async fn mid_flight_run_for_other_version_is_refused() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    store
        .transition_with("c1", ClusterStatus::Pending, ClusterStatus::PreCheckRunning, None, |c| {
            c.target_version = Some("1.21.0".into())
        })
        .unwrap();
    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.22.0", CancelToken::never()).await;
    assert!(matches!(outcome, ClusterOutcome::Failed(_)));
    assert_eq!(store.get("c1").unwrap().status, ClusterStatus::PreCheckRunning);
}

#[tokio::test(start_paused = true)]
async fn cancel_leaves_last_durable_status() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness.changes.merged.store(false, Ordering::SeqCst);
    let mut settings = settings();
    settings.merge_timeout = Duration::from_secs(60 * 60);
    let orch = Arc::new(Orchestrator::new(
        store.clone(),
        harness.providers(),
        settings,
        thresholds(),
    ));

    let (handle, token) = CancelHandle::pair();
    let task = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_cluster("c1", "1.21.0", token).await })
    };
    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    handle.cancel();

    assert_eq!(task.await.unwrap(), ClusterOutcome::Cancelled);
    assert_eq!(store.get("c1").unwrap().status, ClusterStatus::AwaitingApproval);

    let leases = LeaseManager::new(store.clone());
    assert!(leases.acquire("c1", "someone-else", Duration::from_secs(60)).unwrap());
    assert!(harness.notifier.wait_for(RolloutEvent::Cancelled).await);
}

#[tokio::test(start_paused = true)]
async fn held_lease_means_contended() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let leases = LeaseManager::new(store.clone());
    assert!(leases.acquire("c1", "op-other", Duration::from_secs(300)).unwrap());

    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);
    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;

    assert_eq!(outcome, ClusterOutcome::Contended);
    assert_eq!(store.get("c1").unwrap().status, ClusterStatus::Pending);
    assert_eq!(harness.prechecks.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn two_operators_one_winner() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    let a = Arc::new(orchestrator(&store, &harness).with_operator_id("op-a"));
    let b = Arc::new(orchestrator(&store, &harness).with_operator_id("op-b"));

    let (first, second) = tokio::join!(
        a.run_cluster("c1", "1.21.0", CancelToken::never()),
        b.run_cluster("c1", "1.21.0", CancelToken::never()),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| **o == ClusterOutcome::Healthy).count(), 1);
    assert!(outcomes.iter().any(|o| matches!(o, ClusterOutcome::Contended)));
    assert_eq!(harness.proposals().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cluster_at_target_is_skipped() {
    let store = store_with(&[("c1", "canary", "1.21.0")]);
    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::Skipped);
    assert!(outcome.is_success());
    assert_eq!(store.get("c1").unwrap().status, ClusterStatus::Pending);
    assert_eq!(harness.prechecks.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn terminal_cluster_is_rearmed_for_new_run() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness
        .prechecks
        .checks
        .lock()
        .unwrap()
        .push(CheckResult::fail("nodes_ready", "1/3 ready"));
    let orch = orchestrator(&store, &harness).with_retry(RetryPolicy::once());
    assert_eq!(
        orch.run_cluster("c1", "1.21.0", CancelToken::never()).await,
        ClusterOutcome::PreCheckFailed
    );

    harness.prechecks.checks.lock().unwrap().pop();
    let outcome = orch.run_cluster("c1", "1.21.0", CancelToken::never()).await;
    assert_eq!(outcome, ClusterOutcome::Healthy);
    assert!(store.get("c1").unwrap().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_cluster_fails() {
    let store = store_with(&[]);
    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);

    let outcome = orch.run_cluster("ghost", "1.21.0", CancelToken::never()).await;
    assert!(matches!(outcome, ClusterOutcome::Failed(ref reason) if reason.contains("ghost")));
}

#[tokio::test(start_paused = true)]
async fn manual_rollback_from_approval_gate() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    harness.changes.merged.store(false, Ordering::SeqCst);
    let orch = orchestrator(&store, &harness);
    assert_eq!(
        orch.run_cluster("c1", "1.21.0", CancelToken::never()).await,
        ClusterOutcome::AwaitingApproval
    );

    harness.changes.merged.store(true, Ordering::SeqCst);
    let outcome = orch.manual_rollback("c1", "pager fired").await.unwrap();
    assert_eq!(outcome, ClusterOutcome::RolledBack);

    let cluster = store.get("c1").unwrap();
    assert_eq!(cluster.status, ClusterStatus::FailedRolledBack);
    assert_eq!(cluster.last_error.as_deref(), Some("manual rollback: pager fired"));
    let (_, version, report) = harness.proposals().pop().unwrap();
    assert_eq!(version, "1.20.0");
    assert_eq!(report.reason.as_deref(), Some("manual rollback: pager fired"));
}

#[tokio::test(start_paused = true)]
async fn manual_rollback_rejected_before_proposal() {
    let store = store_with(&[("c1", "canary", "1.20.0")]);
    let harness = Harness::new();
    let orch = orchestrator(&store, &harness);

    let err = orch.manual_rollback("c1", "just because").await.unwrap_err();
    assert!(matches!(
        err,
        RolloutError::State(StateError::InvalidTransition {
            from: ClusterStatus::Pending,
            to: ClusterStatus::RollbackRequired,
        })
    ));
}
