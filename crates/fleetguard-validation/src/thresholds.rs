//! Validation thresholds supplied per rollout run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected threshold configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("threshold `{name}` must be finite and non-negative, got {value}")]
    OutOfRange { name: &'static str, value: f64 },
}

/// Numeric limits the comparator checks a post-change snapshot against.
///
/// Percentages are maximum allowed increases relative to baseline.
/// Every field is required when deserialized: a config file that omits
/// one is rejected rather than silently defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationThresholds {
    pub latency_p95_increase_percent: f64,
    pub latency_p99_increase_percent: f64,
    /// Absolute ceiling on the current error rate (0.0–1.0).
    pub error_rate_max: f64,
    /// Maximum `current - baseline` error rate delta.
    pub error_rate_increase_max: f64,
    pub resource_increase_percent: f64,
    pub control_plane_resource_increase_percent: f64,
    pub gateway_resource_increase_percent: f64,
    /// Minimum current request volume for the comparison to count.
    pub min_request_volume: f64,
    /// Maximum rejected configuration pushes from the control plane.
    pub control_plane_reject_max: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            latency_p95_increase_percent: 10.0,
            latency_p99_increase_percent: 15.0,
            error_rate_max: 0.001,
            error_rate_increase_max: 0.0005,
            resource_increase_percent: 25.0,
            control_plane_resource_increase_percent: 30.0,
            gateway_resource_increase_percent: 30.0,
            min_request_volume: 1000.0,
            control_plane_reject_max: 10.0,
        }
    }
}

impl ValidationThresholds {
    /// Reject NaN, infinite, or negative limits.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let fields = [
            ("latency_p95_increase_percent", self.latency_p95_increase_percent),
            ("latency_p99_increase_percent", self.latency_p99_increase_percent),
            ("error_rate_max", self.error_rate_max),
            ("error_rate_increase_max", self.error_rate_increase_max),
            ("resource_increase_percent", self.resource_increase_percent),
            (
                "control_plane_resource_increase_percent",
                self.control_plane_resource_increase_percent,
            ),
            (
                "gateway_resource_increase_percent",
                self.gateway_resource_increase_percent,
            ),
            ("min_request_volume", self.min_request_volume),
            ("control_plane_reject_max", self.control_plane_reject_max),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(ThresholdError::OutOfRange { name, value });
            }
        }
        Ok(())
    }
}
