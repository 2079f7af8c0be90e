//! fleetguard-rollout — progressive cluster upgrade orchestration.
//!
//! Clusters are grouped into batches with prerequisite edges. A batch
//! starts only once every cluster of its prerequisites is healthy; its
//! members are then driven through
//! pre-check → proposal → approval → reconciliation → soak → validation,
//! or through the reviewed rollback branch when validation fails.
//!
//! External systems are reached only through the traits in
//! [`providers`]; all progress is persisted in a
//! [`fleetguard_state::StateStore`] so a restarted run resumes from the
//! last durable status.

pub mod cancel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod providers;
pub mod resolver;
pub mod retry;
pub mod rollback;
pub mod runner;

pub use cancel::{CancelHandle, CancelRegistry, CancelToken};
pub use config::{ConfigError, OrchestratorSettings, RolloutConfig};
pub use error::{ExternalError, RolloutError, RolloutResult};
pub use orchestrator::{ClusterOutcome, Orchestrator};
pub use providers::{
    ChangeKind, ChangeProvider, ChangeReport, CheckResult, LogNotifier, MetricsProvider, Notifier,
    PreCheckProvider, Providers, ReconciliationProvider, RolloutEvent,
};
pub use resolver::{BatchSpec, Blocker, DependencyResolver, Readiness};
pub use retry::RetryPolicy;
pub use rollback::{RollbackCoordinator, RollbackMark};
pub use runner::{BatchReport, BatchRunner, RollbackReport, RunId};
