//! Metric catalog — maps metric names to the rule that applies to them.
//!
//! Monitoring backends name the same quantity differently, so several
//! aliases can map to one [`MetricKind`]. Names the catalog does not know
//! are still covered by the missing-metric rule.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Resource class; control-plane and gateway components get their own,
/// usually looser, growth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    General,
    ControlPlane,
    Gateway,
}

/// Which comparison rule a metric is subject to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    LatencyP95,
    LatencyP99,
    ErrorRate,
    RequestVolume,
    Resource(ResourceTier),
    ControlPlaneRejects,
}

pub const LATENCY_P95: &str = "latency.p95";
pub const LATENCY_P99: &str = "latency.p99";
pub const ERROR_RATE: &str = "error.rate";
pub const REQUEST_COUNT: &str = "request.count";
pub const CPU_USAGE: &str = "cpu.usage";
pub const MEMORY_USAGE: &str = "memory.usage";
pub const CONTROL_PLANE_CPU: &str = "control_plane.cpu";
pub const CONTROL_PLANE_MEMORY: &str = "control_plane.memory";
pub const GATEWAY_CPU: &str = "gateway.cpu";
pub const GATEWAY_MEMORY: &str = "gateway.memory";
pub const CONTROL_PLANE_REJECTS: &str = "control_plane.xds_rejects";

const DEFAULTS: &[(&str, MetricKind)] = &[
    (LATENCY_P95, MetricKind::LatencyP95),
    ("istio.request.duration.p95", MetricKind::LatencyP95),
    ("http.latency.p95", MetricKind::LatencyP95),
    (LATENCY_P99, MetricKind::LatencyP99),
    ("istio.request.duration.p99", MetricKind::LatencyP99),
    ("http.latency.p99", MetricKind::LatencyP99),
    (ERROR_RATE, MetricKind::ErrorRate),
    ("istio.request.error_rate", MetricKind::ErrorRate),
    ("http.error_rate", MetricKind::ErrorRate),
    (REQUEST_COUNT, MetricKind::RequestVolume),
    ("istio.request.count", MetricKind::RequestVolume),
    ("http.request_count", MetricKind::RequestVolume),
    (CPU_USAGE, MetricKind::Resource(ResourceTier::General)),
    (MEMORY_USAGE, MetricKind::Resource(ResourceTier::General)),
    (CONTROL_PLANE_CPU, MetricKind::Resource(ResourceTier::ControlPlane)),
    (CONTROL_PLANE_MEMORY, MetricKind::Resource(ResourceTier::ControlPlane)),
    ("istiod.cpu", MetricKind::Resource(ResourceTier::ControlPlane)),
    ("istiod.memory", MetricKind::Resource(ResourceTier::ControlPlane)),
    ("istiod.cpu_usage", MetricKind::Resource(ResourceTier::ControlPlane)),
    ("istiod.mem_usage", MetricKind::Resource(ResourceTier::ControlPlane)),
    (GATEWAY_CPU, MetricKind::Resource(ResourceTier::Gateway)),
    (GATEWAY_MEMORY, MetricKind::Resource(ResourceTier::Gateway)),
    ("gateway.cpu_usage", MetricKind::Resource(ResourceTier::Gateway)),
    ("gateway.mem_usage", MetricKind::Resource(ResourceTier::Gateway)),
    (CONTROL_PLANE_REJECTS, MetricKind::ControlPlaneRejects),
    ("pilot_total_xds_rejects", MetricKind::ControlPlaneRejects),
    ("pilot.xds.rejects", MetricKind::ControlPlaneRejects),
];

/// Name → kind lookup table.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    kinds: HashMap<String, MetricKind>,
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self {
            kinds: DEFAULTS
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
        }
    }
}

impl MetricCatalog {
    /// A catalog with no names registered.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Register (or re-map) a metric name.
    pub fn register(&mut self, name: &str, kind: MetricKind) -> &mut Self {
        self.kinds.insert(name.to_string(), kind);
        self
    }

    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.kinds.get(name).copied()
    }

    /// All names mapped to `kind`, sorted.
    pub fn names_of(&self, kind: MetricKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .kinds
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(n, _)| n.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}
