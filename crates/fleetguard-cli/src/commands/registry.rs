use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use fleetguard_rollout::RolloutConfig;
use fleetguard_state::{Cluster, StateError};
use tracing::{info, warn};

use super::open_store;

pub fn register(data_dir: &Path, config: &Path) -> anyhow::Result<ExitCode> {
    let config = RolloutConfig::from_file(config)?;
    let store = open_store(data_dir)?;

    let mut added = 0usize;
    for entry in &config.clusters {
        match store.register(entry.to_cluster()) {
            Ok(_) => added += 1,
            Err(StateError::AlreadyExists(id)) => {
                warn!(cluster_id = %id, "already registered, skipping");
            }
            Err(e) => return Err(e).with_context(|| format!("registering {}", entry.id)),
        }
    }
    info!(added, total = config.clusters.len(), "registry populated");
    println!("registered {added} of {} clusters", config.clusters.len());
    Ok(ExitCode::SUCCESS)
}

pub fn status(data_dir: &Path, cluster_id: &str, format: &str) -> anyhow::Result<ExitCode> {
    let store = open_store(data_dir)?;
    let Some(cluster) = store.find(cluster_id)? else {
        eprintln!("cluster {cluster_id} is not registered");
        return Ok(ExitCode::FAILURE);
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&cluster)?),
        _ => print!("{}", describe(&cluster)),
    }
    Ok(ExitCode::SUCCESS)
}

pub fn list(data_dir: &Path, batch: Option<&str>, format: &str) -> anyhow::Result<ExitCode> {
    let store = open_store(data_dir)?;
    let clusters = match batch {
        Some(batch) => store.query_by_batch(batch)?,
        None => store.list_clusters()?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&clusters)?),
        _ => {
            println!(
                "{:<24} {:<12} {:<28} {:<10} {:<10}",
                "CLUSTER", "BATCH", "STATUS", "VERSION", "TARGET"
            );
            for c in &clusters {
                println!(
                    "{:<24} {:<12} {:<28} {:<10} {:<10}",
                    c.cluster_id,
                    c.batch_id,
                    c.status.as_str(),
                    c.current_version,
                    c.target_version.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(c: &Cluster) -> String {
    let mut out = String::new();
    let mut line = |k: &str, v: &str| out.push_str(&format!("{k:<16} {v}\n"));
    line("cluster", &c.cluster_id);
    line("batch", &c.batch_id);
    line("environment", &format!("{} / {}", c.environment, c.region));
    line("status", c.status.as_str());
    line("version", &c.current_version);
    line("target", c.target_version.as_deref().unwrap_or("-"));
    line("change", c.change_ref.as_deref().unwrap_or("-"));
    line("rollback", c.rollback_ref.as_deref().unwrap_or("-"));
    line("lease holder", c.lease_holder.as_deref().unwrap_or("-"));
    if let Some(err) = &c.last_error {
        line("last error", err);
    }
    for entry in &c.upgrade_history {
        line(
            "history",
            &format!(
                "{} -> {} ({:?})",
                entry.from_version, entry.to_version, entry.outcome
            ),
        );
    }
    out
}
