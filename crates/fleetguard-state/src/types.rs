//! Domain types for the fleetguard state store.
//!
//! The cluster record is the single source of truth for rollout progress.
//! Its status is an explicit enum with a fixed transition table; the store
//! rejects any edge that is not listed in [`ClusterStatus::successors`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster.
pub type ClusterId = String;

/// Name of a rollout batch.
pub type BatchId = String;

// ── Status machine ─────────────────────────────────────────────────

/// Rollout status of a single cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Pending,
    PreCheckRunning,
    PreCheckPassed,
    PreCheckFailed,
    ChangeProposed,
    AwaitingApproval,
    ChangeApplied,
    Soaking,
    Validating,
    Healthy,
    /// The change proposal could not be created; nothing was merged.
    ProposalFailed,
    RollbackRequired,
    RollbackProposed,
    AwaitingRollbackApproval,
    FailedRolledBack,
    /// The revert could not be carried through; only an operator-initiated
    /// rollback moves the cluster on.
    RollbackFailed,
}

use ClusterStatus::*;

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 16] = [
        Pending,
        PreCheckRunning,
        PreCheckPassed,
        PreCheckFailed,
        ChangeProposed,
        AwaitingApproval,
        ChangeApplied,
        Soaking,
        Validating,
        Healthy,
        ProposalFailed,
        RollbackRequired,
        RollbackProposed,
        AwaitingRollbackApproval,
        FailedRolledBack,
        RollbackFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Pending => "pending",
            PreCheckRunning => "pre_check_running",
            PreCheckPassed => "pre_check_passed",
            PreCheckFailed => "pre_check_failed",
            ChangeProposed => "change_proposed",
            AwaitingApproval => "awaiting_approval",
            ChangeApplied => "change_applied",
            Soaking => "soaking",
            Validating => "validating",
            Healthy => "healthy",
            ProposalFailed => "proposal_failed",
            RollbackRequired => "rollback_required",
            RollbackProposed => "rollback_proposed",
            AwaitingRollbackApproval => "awaiting_rollback_approval",
            FailedRolledBack => "failed_rolled_back",
            RollbackFailed => "rollback_failed",
        }
    }

    /// Statuses a rollout never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Healthy | PreCheckFailed | ProposalFailed | FailedRolledBack | RollbackFailed
        )
    }

    /// Only `healthy` satisfies a dependent batch.
    pub fn is_terminal_success(self) -> bool {
        self == Healthy
    }

    /// Phases that block on an operator merging a change.
    pub fn is_human_gate(self) -> bool {
        matches!(self, AwaitingApproval | AwaitingRollbackApproval)
    }

    /// Phases where a change has been merged and can be reverted.
    pub fn is_post_merge(self) -> bool {
        matches!(self, ChangeApplied | Soaking | Validating)
    }

    /// Permitted next statuses.
    ///
    /// Terminal statuses may only move back to `pending`, which re-arms a
    /// cluster for a new rollout. The exception is `rollback_failed`, which
    /// can only re-enter the rollback branch.
    pub fn successors(self) -> &'static [ClusterStatus] {
        match self {
            Pending => &[PreCheckRunning],
            PreCheckRunning => &[PreCheckPassed, PreCheckFailed],
            PreCheckPassed => &[ChangeProposed, ProposalFailed],
            ChangeProposed => &[AwaitingApproval],
            AwaitingApproval => &[ChangeApplied, RollbackRequired],
            ChangeApplied => &[Soaking, RollbackRequired],
            Soaking => &[Validating, RollbackRequired],
            Validating => &[Healthy, RollbackRequired],
            RollbackRequired => &[RollbackProposed, RollbackFailed],
            RollbackProposed => &[AwaitingRollbackApproval],
            AwaitingRollbackApproval => &[FailedRolledBack, RollbackFailed],
            RollbackFailed => &[RollbackRequired],
            Healthy | PreCheckFailed | ProposalFailed | FailedRolledBack => &[Pending],
        }
    }

    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown cluster status `{s}`"))
    }
}

// ── Cluster record ─────────────────────────────────────────────────

/// Result of one pre-upgrade health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    pub fn pass(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.to_string(),
        }
    }

    pub fn fail(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.to_string(),
        }
    }
}

/// How an upgrade attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Upgraded,
    RolledBack,
}

/// One completed upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeHistoryEntry {
    pub from_version: String,
    pub to_version: String,
    pub outcome: UpgradeOutcome,
    pub change_ref: Option<String>,
    /// Unix timestamp (milliseconds).
    pub at_ms: u64,
}

/// Persisted rollout state of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: ClusterId,
    pub batch_id: BatchId,
    pub environment: String,
    pub region: String,
    #[serde(default)]
    pub owner_team: Option<String>,
    /// Version actually running. Only advances when a rollout reaches `healthy`.
    pub current_version: String,
    #[serde(default)]
    pub target_version: Option<String>,
    /// Version the cluster ran before its last successful upgrade.
    #[serde(default)]
    pub previous_version: Option<String>,
    pub status: ClusterStatus,
    /// Mirror of the lease row at the last transition. Informational only.
    #[serde(default)]
    pub lease_holder: Option<String>,
    #[serde(default)]
    pub lease_expires_at_ms: Option<u64>,
    /// Incremented by every successful transition.
    pub version: u64,
    pub last_updated_ms: u64,
    #[serde(default)]
    pub change_ref: Option<String>,
    #[serde(default)]
    pub rollback_ref: Option<String>,
    #[serde(default)]
    pub soak_started_at_ms: Option<u64>,
    /// Checks that passed for the in-flight upgrade; quoted in its proposal.
    #[serde(default)]
    pub pre_checks: Vec<CheckResult>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub upgrade_history: Vec<UpgradeHistoryEntry>,
}

impl Cluster {
    /// A freshly populated `pending` record.
    pub fn new(
        cluster_id: impl Into<String>,
        batch_id: impl Into<String>,
        environment: impl Into<String>,
        region: impl Into<String>,
        current_version: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            batch_id: batch_id.into(),
            environment: environment.into(),
            region: region.into(),
            owner_team: None,
            current_version: current_version.into(),
            target_version: None,
            previous_version: None,
            status: Pending,
            lease_holder: None,
            lease_expires_at_ms: None,
            version: 0,
            last_updated_ms: 0,
            change_ref: None,
            rollback_ref: None,
            soak_started_at_ms: None,
            pre_checks: Vec::new(),
            last_error: None,
            upgrade_history: Vec::new(),
        }
    }

    pub fn with_owner_team(mut self, team: impl Into<String>) -> Self {
        self.owner_team = Some(team.into());
        self
    }

    /// Whether the cluster already runs `version` and has nothing to do.
    pub fn is_at_version(&self, version: &str) -> bool {
        self.current_version == version
    }
}

// ── Leases ─────────────────────────────────────────────────────────

/// Ephemeral ownership record over a resource (usually a cluster id).
///
/// Released leases stay in the table so the fencing token keeps
/// increasing across holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: String,
    pub holder: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
    /// Incremented on every successful acquisition of this resource.
    pub fencing_token: u64,
    #[serde(default)]
    pub released: bool,
}

impl Lease {
    /// Live at `now_ms`: not released and `now_ms < expires_at_ms`.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        !self.released && now_ms < self.expires_at_ms
    }

    pub fn is_held_by(&self, holder: &str, now_ms: u64) -> bool {
        self.holder == holder && self.is_valid_at(now_ms)
    }

    pub fn fence(&self) -> Fence {
        Fence {
            holder: self.holder.clone(),
            token: self.fencing_token,
        }
    }
}

/// Proof of lease ownership presented with a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fence {
    pub holder: String,
    pub token: u64,
}

impl Fence {
    /// Whether `lease` is still the live lease this fence was issued from.
    pub fn admits(&self, lease: &Lease, now_ms: u64) -> bool {
        lease.fencing_token == self.token && lease.is_held_by(&self.holder, now_ms)
    }
}
