//! Comparator — pass/fail decision over a baseline and a current snapshot.
//!
//! Rules, applied in this order:
//!
//! 1. Volume gate: current request volume below the floor is an
//!    "insufficient data" violation.
//! 2. Missing metrics: present in baseline, absent in current.
//! 3. Latency p95 / p99: percentage increase, each against its own limit.
//! 4. Error rate: absolute ceiling and increase over baseline, independently.
//! 5. Resource usage: percentage increase against the tier's limit.
//! 6. Control-plane rejects: absolute count.
//!
//! All limits are strict: a value exactly at the limit passes.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{MetricCatalog, MetricKind, REQUEST_COUNT, ResourceTier};
use crate::metrics::MetricsSnapshot;
use crate::thresholds::ValidationThresholds;

/// Denominator floor for percentage changes.
pub const EPSILON: f64 = 1e-6;

/// Percentage change from `baseline` to `current`.
pub fn percent_change(baseline: f64, current: f64) -> f64 {
    (current - baseline) * 100.0 / baseline.max(EPSILON)
}

/// Why a metric failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    InsufficientData,
    MissingMetric,
    LatencyIncrease,
    ErrorRateTooHigh,
    ErrorRateIncrease,
    ResourceIncrease,
    ControlPlaneRejects,
}

/// A single named reason a validation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub metric: String,
    pub baseline: Option<f64>,
    pub current: Option<f64>,
    /// The breached limit, in the unit of the rule (percent, rate, count).
    pub limit: f64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = fmt_opt(self.baseline);
        let c = fmt_opt(self.current);
        match self.kind {
            ViolationKind::InsufficientData => write!(
                f,
                "insufficient data: {} = {c}, below minimum request volume {}",
                self.metric, self.limit
            ),
            ViolationKind::MissingMetric => write!(
                f,
                "missing metric: {} absent in current snapshot (baseline {b})",
                self.metric
            ),
            ViolationKind::LatencyIncrease | ViolationKind::ResourceIncrease => {
                let pct = match (self.baseline, self.current) {
                    (Some(b), Some(c)) => format!("{:.1}%", percent_change(b, c)),
                    _ => "n/a".to_string(),
                };
                let what = if self.kind == ViolationKind::LatencyIncrease {
                    "latency increase"
                } else {
                    "resource increase"
                };
                write!(
                    f,
                    "{what}: {} grew {pct} (baseline {b}, current {c}, limit {}%)",
                    self.metric, self.limit
                )
            }
            ViolationKind::ErrorRateTooHigh => write!(
                f,
                "error rate too high: {} = {c} (max {})",
                self.metric, self.limit
            ),
            ViolationKind::ErrorRateIncrease => write!(
                f,
                "error rate increase: {} went from {b} to {c} (max increase {})",
                self.metric, self.limit
            ),
            ViolationKind::ControlPlaneRejects => write!(
                f,
                "control-plane rejects: {} = {c} (max {})",
                self.metric, self.limit
            ),
        }
    }
}

/// Name reported when no volume metric was captured at all.
fn gate_metric_name<'a>(volume_names: &[&'a str]) -> &'a str {
    if volume_names.contains(&REQUEST_COUNT) {
        REQUEST_COUNT
    } else {
        volume_names.first().copied().unwrap_or(REQUEST_COUNT)
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v}"),
        None => "absent".to_string(),
    }
}

/// Outcome of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Whether any violation of `kind` was recorded.
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// One rendered line per violation, for inclusion in reports.
    pub fn report_lines(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Deterministic baseline/current comparator.
#[derive(Debug, Clone)]
pub struct Comparator {
    thresholds: ValidationThresholds,
    catalog: MetricCatalog,
}

impl Comparator {
    pub fn new(thresholds: ValidationThresholds) -> Self {
        Self {
            thresholds,
            catalog: MetricCatalog::default(),
        }
    }

    pub fn with_catalog(mut self, catalog: MetricCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn thresholds(&self) -> &ValidationThresholds {
        &self.thresholds
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Compare two snapshots.
    pub fn compare(
        &self,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
    ) -> ValidationResult {
        let mut violations = Vec::new();

        self.check_volume(current, &mut violations);

        for (name, value) in baseline.iter() {
            if value.is_present() && !current.get(name).is_present() {
                violations.push(Violation {
                    kind: ViolationKind::MissingMetric,
                    metric: name.to_string(),
                    baseline: value.get(),
                    current: None,
                    limit: 0.0,
                });
            }
        }

        let names: BTreeSet<&str> = baseline
            .iter()
            .chain(current.iter())
            .map(|(name, _)| name)
            .collect();

        for name in names {
            let Some(kind) = self.catalog.kind(name) else {
                continue;
            };
            let b = baseline.get(name).get();
            let c = current.get(name).get();
            self.check_metric(name, kind, b, c, &mut violations);
        }

        let result = ValidationResult::from_violations(violations);
        info!(
            passed = result.passed,
            violations = result.violations.len(),
            baseline_metrics = baseline.len(),
            current_metrics = current.len(),
            "metrics comparison completed"
        );
        result
    }

    fn check_volume(&self, current: &MetricsSnapshot, violations: &mut Vec<Violation>) {
        let floor = self.thresholds.min_request_volume;
        let volume_names = self.catalog.names_of(MetricKind::RequestVolume);

        let observed = volume_names
            .iter()
            .filter_map(|name| current.get(name).get().map(|v| (*name, v)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match observed {
            Some((_, v)) if v >= floor => {}
            Some((name, v)) => violations.push(Violation {
                kind: ViolationKind::InsufficientData,
                metric: name.to_string(),
                baseline: None,
                current: Some(v),
                limit: floor,
            }),
            None => violations.push(Violation {
                kind: ViolationKind::InsufficientData,
                metric: gate_metric_name(&volume_names).to_string(),
                baseline: None,
                current: None,
                limit: floor,
            }),
        }
    }

    fn check_metric(
        &self,
        name: &str,
        kind: MetricKind,
        baseline: Option<f64>,
        current: Option<f64>,
        violations: &mut Vec<Violation>,
    ) {
        let t = &self.thresholds;
        match kind {
            MetricKind::LatencyP95 | MetricKind::LatencyP99 => {
                let limit = if kind == MetricKind::LatencyP95 {
                    t.latency_p95_increase_percent
                } else {
                    t.latency_p99_increase_percent
                };
                let regressed = match (baseline, current) {
                    (Some(b), Some(c)) => percent_change(b, c) > limit,
                    _ => false,
                };
                if regressed {
                    violations.push(Violation {
                        kind: ViolationKind::LatencyIncrease,
                        metric: name.to_string(),
                        baseline,
                        current,
                        limit,
                    });
                }
            }
            MetricKind::ErrorRate => {
                let Some(c) = current else { return };
                if c > t.error_rate_max {
                    violations.push(Violation {
                        kind: ViolationKind::ErrorRateTooHigh,
                        metric: name.to_string(),
                        baseline,
                        current,
                        limit: t.error_rate_max,
                    });
                }
                if baseline.is_some_and(|b| c - b > t.error_rate_increase_max) {
                    violations.push(Violation {
                        kind: ViolationKind::ErrorRateIncrease,
                        metric: name.to_string(),
                        baseline,
                        current,
                        limit: t.error_rate_increase_max,
                    });
                }
            }
            MetricKind::Resource(tier) => {
                let limit = match tier {
                    ResourceTier::General => t.resource_increase_percent,
                    ResourceTier::ControlPlane => t.control_plane_resource_increase_percent,
                    ResourceTier::Gateway => t.gateway_resource_increase_percent,
                };
                // Decreases are negative and never exceed a limit.
                let grew = match (baseline, current) {
                    (Some(b), Some(c)) => percent_change(b, c) > limit,
                    _ => false,
                };
                if grew {
                    violations.push(Violation {
                        kind: ViolationKind::ResourceIncrease,
                        metric: name.to_string(),
                        baseline,
                        current,
                        limit,
                    });
                }
            }
            MetricKind::ControlPlaneRejects => {
                if current.is_some_and(|c| c > t.control_plane_reject_max) {
                    violations.push(Violation {
                        kind: ViolationKind::ControlPlaneRejects,
                        metric: name.to_string(),
                        baseline,
                        current,
                        limit: t.control_plane_reject_max,
                    });
                }
            }
            MetricKind::RequestVolume => {
                debug!(metric = %name, "request volume handled by the volume gate");
            }
        }
    }
}

/// Compare with the default catalog.
pub fn compare(
    baseline: &MetricsSnapshot,
    current: &MetricsSnapshot,
    thresholds: &ValidationThresholds,
) -> ValidationResult {
    Comparator::new(thresholds.clone()).compare(baseline, current)
}
