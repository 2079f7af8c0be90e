//! fleetguard-validation — post-change metric validation.
//!
//! Pure decision logic: given a baseline snapshot (captured before a
//! change) and a current snapshot (captured after the soak period), the
//! [`Comparator`] decides pass/fail against [`ValidationThresholds`] and
//! lists every [`Violation`].
//!
//! # Components
//!
//! - **`metrics`** — nullable metric values and name-ordered snapshots
//! - **`thresholds`** — per-run numeric limits
//! - **`catalog`** — metric name → rule mapping, with backend aliases
//! - **`comparator`** — the decision itself

pub mod catalog;
pub mod comparator;
pub mod metrics;
pub mod thresholds;

pub use catalog::{MetricCatalog, MetricKind, ResourceTier};
pub use comparator::{
    Comparator, ValidationResult, Violation, ViolationKind, compare, percent_change,
};
pub use metrics::{MetricValue, MetricsSnapshot, TimeWindow};
pub use thresholds::{ThresholdError, ValidationThresholds};
