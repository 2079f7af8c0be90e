use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use fleetguard_rollout::RolloutConfig;
use fleetguard_validation::{Comparator, MetricsSnapshot, ValidationThresholds};

fn read_snapshot(path: &Path) -> anyhow::Result<MetricsSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_snapshot(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Accepts either a full snapshot or a flat `{"name": value}` object.
fn parse_snapshot(raw: &str) -> anyhow::Result<MetricsSnapshot> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.get("values").is_some() {
        return Ok(serde_json::from_value(value)?);
    }
    let flat: std::collections::BTreeMap<String, Option<f64>> = serde_json::from_value(value)?;
    Ok(flat
        .into_iter()
        .map(|(name, v)| (name, fleetguard_validation::MetricValue::from(v)))
        .collect())
}

pub fn compare(baseline: &Path, current: &Path, config: Option<&Path>) -> anyhow::Result<ExitCode> {
    let thresholds = match config {
        Some(path) => RolloutConfig::from_file(path)?.thresholds,
        None => ValidationThresholds::default(),
    };
    let baseline = read_snapshot(baseline)?;
    let current = read_snapshot(current)?;

    let result = Comparator::new(thresholds).compare(&baseline, &current);
    if result.passed {
        println!("PASS: no violations");
        return Ok(ExitCode::SUCCESS);
    }
    println!("FAIL: {} violation(s)", result.violations.len());
    for line in result.report_lines() {
        println!("  - {line}");
    }
    Ok(ExitCode::FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetguard_validation::catalog;

    #[test]
    fn flat_objects_parse_with_nulls_as_absent() {
        let snap = parse_snapshot(r#"{"latency.p95": 120.5, "error.rate": null}"#).unwrap();
        assert_eq!(snap.get(catalog::LATENCY_P95).get(), Some(120.5));
        assert!(!snap.get(catalog::ERROR_RATE).is_present());
        assert!(snap.contains(catalog::ERROR_RATE));
    }

    #[test]
    fn full_snapshots_round_trip() {
        let snap = MetricsSnapshot::new().with(catalog::REQUEST_COUNT, 4200.0);
        let raw = serde_json::to_string(&snap).unwrap();
        assert_eq!(parse_snapshot(&raw).unwrap(), snap);
    }
}
