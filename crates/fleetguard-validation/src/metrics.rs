//! Metric values and snapshots.
//!
//! A [`MetricValue`] is explicitly nullable: a failed or empty query is
//! carried as absent and never turned into a number. Snapshots are keyed
//! by metric name in a `BTreeMap`, so iteration order is the same no
//! matter how the snapshot was assembled.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single metric reading that may be absent.
///
/// Non-finite readings (NaN, ±inf) are normalized to absent at
/// construction and on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub struct MetricValue(Option<f64>);

impl MetricValue {
    /// The absent reading.
    pub const ABSENT: MetricValue = MetricValue(None);

    /// A present reading. Non-finite input becomes absent.
    pub fn present(value: f64) -> Self {
        if value.is_finite() {
            Self(Some(value))
        } else {
            Self(None)
        }
    }

    pub fn get(self) -> Option<f64> {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.0.is_some()
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::present(value)
    }
}

impl From<Option<f64>> for MetricValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::ABSENT, Self::present)
    }
}

impl From<MetricValue> for Option<f64> {
    fn from(value: MetricValue) -> Self {
        value.0
    }
}

/// Time range (unix seconds, half-open) a snapshot was aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: u64,
    pub end: u64,
}

impl TimeWindow {
    /// Window of `length_secs` ending at `end`.
    pub fn ending_at(end: u64, length_secs: u64) -> Self {
        Self {
            start: end.saturating_sub(length_secs),
            end,
        }
    }

    pub fn length_secs(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Metric name → value mapping captured over a time window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default)]
    pub values: BTreeMap<String, MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<MetricValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<MetricValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Reading for `name`; a name that was never recorded is absent.
    pub fn get(&self, name: &str) -> MetricValue {
        self.values.get(name).copied().unwrap_or(MetricValue::ABSENT)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterate readings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, MetricValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<String>, V: Into<MetricValue>> FromIterator<(S, V)> for MetricsSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            window: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_values_are_absent() {
        assert_eq!(MetricValue::present(f64::NAN), MetricValue::ABSENT);
        assert_eq!(MetricValue::from(f64::INFINITY), MetricValue::ABSENT);
        assert_eq!(MetricValue::present(0.0).get(), Some(0.0));
    }

    #[test]
    fn unknown_name_reads_as_absent_not_zero() {
        let snap = MetricsSnapshot::new().with("latency.p95", 100.0);
        assert_eq!(snap.get("latency.p99"), MetricValue::ABSENT);
        assert!(!snap.get("latency.p99").is_present());
    }

    #[test]
    fn null_deserializes_as_absent() {
        let json = r#"{"values":{"latency.p95":null,"request.count":5000.0}}"#;
        let snap: MetricsSnapshot = serde_json::from_str(json).unwrap();
        assert!(snap.contains("latency.p95"));
        assert_eq!(snap.get("latency.p95"), MetricValue::ABSENT);
        assert_eq!(snap.get("request.count").get(), Some(5000.0));
    }

    #[test]
    fn iteration_is_name_ordered() {
        let snap: MetricsSnapshot = [("b", 2.0), ("a", 1.0), ("c", 3.0)].into_iter().collect();
        let names: Vec<&str> = snap.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn window_ending_at_saturates() {
        let w = TimeWindow::ending_at(100, 600);
        assert_eq!(w.start, 0);
        assert_eq!(TimeWindow::ending_at(1_000, 600).length_secs(), 600);
    }
}
