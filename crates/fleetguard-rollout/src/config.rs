//! fleetguard.toml configuration parser.
//!
//! The file mirrors the rollout's moving parts: orchestrator timings,
//! retry policy, validation thresholds, batch graph, and the cluster
//! records used to populate the registry. Durations are human strings
//! (`"300s"`, `"500ms"`, `"15m"`, `"1h"`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetguard_state::Cluster;
use fleetguard_validation::{ThresholdError, ValidationThresholds, catalog};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::{BatchSpec, DependencyResolver};
use crate::retry::RetryPolicy;

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error(transparent)]
    Threshold(#[from] ThresholdError),

    #[error("duplicate batch `{0}`")]
    DuplicateBatch(String),

    #[error("batch `{batch}` depends on unknown batch `{prerequisite}`")]
    UnknownPrerequisite { batch: String, prerequisite: String },

    #[error("cyclic batch dependency: {}", cycle.join(" -> "))]
    CyclicBatches { cycle: Vec<String> },

    #[error("cluster `{cluster}` listed in both `{first}` and `{second}`")]
    DuplicateCluster {
        cluster: String,
        first: String,
        second: String,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Parse a duration string like "300s", "500ms", "15m", "1h".
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()?
            .checked_mul(60)
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()?
            .checked_mul(3600)
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn duration_field(
    field: &'static str,
    value: Option<&String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::Duration {
            field,
            value: raw.clone(),
        }),
    }
}

// ── File layout ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    pub operator_id: Option<String>,
    pub parallelism: Option<usize>,
    pub lease_ttl: Option<String>,
    pub renew_interval: Option<String>,
    pub soak: Option<String>,
    pub merge_timeout: Option<String>,
    pub reconcile_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub max_poll_interval: Option<String>,
    pub baseline_window: Option<String>,
    pub current_window: Option<String>,
    pub metrics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<String>,
    pub max_delay: Option<String>,
    pub multiplier: Option<f64>,
}

/// A `[[clusters]]` entry used to populate the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterEntry {
    pub id: String,
    pub batch: String,
    pub environment: String,
    pub region: String,
    pub current_version: String,
    pub owner_team: Option<String>,
}

impl ClusterEntry {
    pub fn to_cluster(&self) -> Cluster {
        let cluster = Cluster::new(
            &self.id,
            &self.batch,
            &self.environment,
            &self.region,
            &self.current_version,
        );
        match &self.owner_team {
            Some(team) => cluster.with_owner_team(team),
            None => cluster,
        }
    }
}

/// Raw `fleetguard.toml` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Required: a rollout never runs against implicit thresholds.
    pub thresholds: ValidationThresholds,
    #[serde(default)]
    pub batches: Vec<BatchSpec>,
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
}

// ── Resolved settings ──────────────────────────────────────────────

/// Timings and limits for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub operator_id: Option<String>,
    /// Clusters processed concurrently within one batch.
    pub parallelism: usize,
    pub lease_ttl: Duration,
    /// Strictly shorter than `lease_ttl`.
    pub renew_interval: Duration,
    pub soak: Duration,
    /// Overall deadline for a merge signal before parking at the gate.
    pub merge_timeout: Duration,
    pub reconcile_timeout: Duration,
    /// First wait between merge-signal polls; doubles up to `max_poll_interval`.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub baseline_window: Duration,
    pub current_window: Duration,
    /// Metric names requested from the metrics provider.
    pub metrics: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let lease_ttl = Duration::from_secs(300);
        Self {
            operator_id: None,
            parallelism: 5,
            lease_ttl,
            renew_interval: lease_ttl / 3,
            soak: Duration::from_secs(60 * 60),
            merge_timeout: Duration::from_secs(60 * 60),
            reconcile_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(30),
            max_poll_interval: Duration::from_secs(5 * 60),
            baseline_window: Duration::from_secs(10 * 60),
            current_window: Duration::from_secs(10 * 60),
            metrics: default_metrics(),
        }
    }
}

impl OrchestratorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid("parallelism must be at least 1".into()));
        }
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::Invalid("lease_ttl must be positive".into()));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "renew_interval ({:?}) must be positive and shorter than lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.poll_interval.is_zero() || self.max_poll_interval < self.poll_interval {
            return Err(ConfigError::Invalid(
                "poll_interval must be positive and not exceed max_poll_interval".into(),
            ));
        }
        Ok(())
    }
}

fn default_metrics() -> Vec<String> {
    [
        catalog::LATENCY_P95,
        catalog::LATENCY_P99,
        catalog::ERROR_RATE,
        catalog::REQUEST_COUNT,
        catalog::CPU_USAGE,
        catalog::MEMORY_USAGE,
        catalog::CONTROL_PLANE_CPU,
        catalog::CONTROL_PLANE_MEMORY,
        catalog::GATEWAY_CPU,
        catalog::GATEWAY_MEMORY,
        catalog::CONTROL_PLANE_REJECTS,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    pub orchestrator: OrchestratorSettings,
    pub retry: RetryPolicy,
    pub thresholds: ValidationThresholds,
    pub batches: Vec<BatchSpec>,
    pub clusters: Vec<ClusterEntry>,
}

impl RolloutConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Self::from_parts(file)
    }

    pub fn from_parts(file: ConfigFile) -> Result<Self, ConfigError> {
        let defaults = OrchestratorSettings::default();
        let o = &file.orchestrator;
        let lease_ttl = duration_field("lease_ttl", o.lease_ttl.as_ref(), defaults.lease_ttl)?;
        let orchestrator = OrchestratorSettings {
            operator_id: o.operator_id.clone(),
            parallelism: o.parallelism.unwrap_or(defaults.parallelism),
            lease_ttl,
            renew_interval: duration_field(
                "renew_interval",
                o.renew_interval.as_ref(),
                lease_ttl / 3,
            )?,
            soak: duration_field("soak", o.soak.as_ref(), defaults.soak)?,
            merge_timeout: duration_field(
                "merge_timeout",
                o.merge_timeout.as_ref(),
                defaults.merge_timeout,
            )?,
            reconcile_timeout: duration_field(
                "reconcile_timeout",
                o.reconcile_timeout.as_ref(),
                defaults.reconcile_timeout,
            )?,
            poll_interval: duration_field(
                "poll_interval",
                o.poll_interval.as_ref(),
                defaults.poll_interval,
            )?,
            max_poll_interval: duration_field(
                "max_poll_interval",
                o.max_poll_interval.as_ref(),
                defaults.max_poll_interval,
            )?,
            baseline_window: duration_field(
                "baseline_window",
                o.baseline_window.as_ref(),
                defaults.baseline_window,
            )?,
            current_window: duration_field(
                "current_window",
                o.current_window.as_ref(),
                defaults.current_window,
            )?,
            metrics: o.metrics.clone().unwrap_or(defaults.metrics),
        };
        orchestrator.validate()?;

        let retry_defaults = RetryPolicy::default();
        let r = &file.retry;
        let retry = RetryPolicy {
            max_attempts: r.max_attempts.unwrap_or(retry_defaults.max_attempts),
            base_delay: duration_field("base_delay", r.base_delay.as_ref(), retry_defaults.base_delay)?,
            max_delay: duration_field("max_delay", r.max_delay.as_ref(), retry_defaults.max_delay)?,
            multiplier: r.multiplier.unwrap_or(retry_defaults.multiplier),
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1".into()));
        }

        file.thresholds.validate()?;
        validate_membership(&file.batches, &file.clusters)?;
        // Graph errors (duplicates, unknown prerequisites, cycles).
        DependencyResolver::new(file.batches.clone())?;

        Ok(Self {
            orchestrator,
            retry,
            thresholds: file.thresholds,
            batches: file.batches,
            clusters: file.clusters,
        })
    }

    pub fn resolver(&self) -> Result<DependencyResolver, ConfigError> {
        DependencyResolver::new(self.batches.clone())
    }
}

/// A cluster belongs to at most one batch, and registry entries must
/// name a batch that exists and agree with its member list.
fn validate_membership(batches: &[BatchSpec], clusters: &[ClusterEntry]) -> Result<(), ConfigError> {
    let mut owner: HashMap<&str, &str> = HashMap::new();
    for batch in batches {
        for cluster in &batch.clusters {
            if let Some(first) = owner.insert(cluster.as_str(), batch.name.as_str()) {
                return Err(ConfigError::DuplicateCluster {
                    cluster: cluster.clone(),
                    first: first.to_string(),
                    second: batch.name.clone(),
                });
            }
        }
    }

    let names: HashSet<&str> = batches.iter().map(|b| b.name.as_str()).collect();
    let mut seen = HashSet::new();
    for entry in clusters {
        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "cluster `{}` defined twice",
                entry.id
            )));
        }
        if !names.contains(entry.batch.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "cluster `{}` names unknown batch `{}`",
                entry.id, entry.batch
            )));
        }
        if let Some(listed) = owner.get(entry.id.as_str()) {
            if *listed != entry.batch {
                return Err(ConfigError::DuplicateCluster {
                    cluster: entry.id.clone(),
                    first: listed.to_string(),
                    second: entry.batch.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: &str = r#"
[thresholds]
latency_p95_increase_percent = 10.0
latency_p99_increase_percent = 15.0
error_rate_max = 0.001
error_rate_increase_max = 0.0005
resource_increase_percent = 25.0
control_plane_resource_increase_percent = 30.0
gateway_resource_increase_percent = 30.0
min_request_volume = 1000.0
control_plane_reject_max = 10.0
"#;

    fn with_thresholds(rest: &str) -> String {
        format!("{rest}\n{THRESHOLDS}")
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX / 1000)), None);
        assert_eq!(
            parse_duration(&format!("{}m", u64::MAX / 60)),
            Some(Duration::from_secs(u64::MAX / 60 * 60))
        );
    }

    #[test]
    fn full_config_parses() {
        let toml = with_thresholds(
            r#"
[orchestrator]
parallelism = 2
lease_ttl = "120s"
soak = "30m"

[retry]
max_attempts = 5
base_delay = "500ms"

[[batches]]
name = "canary"
clusters = ["c1"]

[[batches]]
name = "prod"
clusters = ["c2", "c3"]
prerequisites = ["canary"]

[[clusters]]
id = "c1"
batch = "canary"
environment = "staging"
region = "eu-west-1"
current_version = "1.20.0"
owner_team = "mesh"
"#,
        );
        let config = RolloutConfig::from_toml(&toml).unwrap();
        assert_eq!(config.orchestrator.parallelism, 2);
        assert_eq!(config.orchestrator.lease_ttl, Duration::from_secs(120));
        assert_eq!(config.orchestrator.renew_interval, Duration::from_secs(40));
        assert_eq!(config.orchestrator.soak, Duration::from_secs(1800));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.batches[1].prerequisites, vec!["canary"]);
        let cluster = config.clusters[0].to_cluster();
        assert_eq!(cluster.owner_team.as_deref(), Some("mesh"));
        assert_eq!(config.resolver().unwrap().order(), vec!["canary", "prod"]);
    }

    #[test]
    fn missing_thresholds_rejected() {
        let err = RolloutConfig::from_toml("[orchestrator]\nparallelism = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let partial = "[thresholds]\nlatency_p95_increase_percent = 10.0\n";
        assert!(matches!(
            RolloutConfig::from_toml(partial),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn renew_interval_must_be_below_ttl() {
        let toml = with_thresholds(
            "[orchestrator]\nlease_ttl = \"60s\"\nrenew_interval = \"60s\"\n",
        );
        assert!(matches!(
            RolloutConfig::from_toml(&toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn bad_duration_names_field() {
        let toml = with_thresholds("[orchestrator]\nsoak = \"forever\"\n");
        assert!(matches!(
            RolloutConfig::from_toml(&toml),
            Err(ConfigError::Duration { field: "soak", .. })
        ));
    }

    #[test]
    fn zero_parallelism_rejected() {
        let toml = with_thresholds("[orchestrator]\nparallelism = 0\n");
        assert!(RolloutConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn negative_threshold_rejected() {
        let toml = THRESHOLDS.replace("error_rate_max = 0.001", "error_rate_max = -1.0");
        assert!(matches!(
            RolloutConfig::from_toml(&toml),
            Err(ConfigError::Threshold(_))
        ));
    }

    #[test]
    fn cyclic_batches_rejected() {
        let toml = with_thresholds(
            r#"
[[batches]]
name = "a"
prerequisites = ["b"]

[[batches]]
name = "b"
prerequisites = ["a"]
"#,
        );
        assert!(matches!(
            RolloutConfig::from_toml(&toml),
            Err(ConfigError::CyclicBatches { .. })
        ));
    }

    #[test]
    fn cluster_in_two_batches_rejected() {
        let toml = with_thresholds(
            r#"
[[batches]]
name = "a"
clusters = ["c1"]

[[batches]]
name = "b"
clusters = ["c1"]
"#,
        );
        assert!(matches!(
            RolloutConfig::from_toml(&toml),
            Err(ConfigError::DuplicateCluster { .. })
        ));
    }

    #[test]
    fn cluster_entry_must_match_batch() {
        let toml = with_thresholds(
            r#"
[[batches]]
name = "a"
clusters = ["c1"]

[[batches]]
name = "b"

[[clusters]]
id = "c1"
batch = "b"
environment = "prod"
region = "us-east-1"
current_version = "1.20.0"
"#,
        );
        assert!(matches!(
            RolloutConfig::from_toml(&toml),
            Err(ConfigError::DuplicateCluster { .. })
        ));
    }
}
