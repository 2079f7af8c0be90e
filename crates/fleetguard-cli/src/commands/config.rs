use std::path::Path;
use std::process::ExitCode;

use fleetguard_rollout::RolloutConfig;

use super::open_store;

pub fn check(config: &Path) -> anyhow::Result<ExitCode> {
    let config = RolloutConfig::from_file(config)?;
    let resolver = config.resolver()?;

    println!("config ok");
    println!("  batches:  {}", resolver.order().join(" -> "));
    println!("  clusters: {}", config.clusters.len());
    println!(
        "  lease ttl {:?}, renew every {:?}, soak {:?}",
        config.orchestrator.lease_ttl, config.orchestrator.renew_interval, config.orchestrator.soak
    );
    Ok(ExitCode::SUCCESS)
}

pub fn can_proceed(data_dir: &Path, config: &Path, batch: &str) -> anyhow::Result<ExitCode> {
    let config = RolloutConfig::from_file(config)?;
    let resolver = config.resolver()?;
    let store = open_store(data_dir)?;

    let readiness = resolver.can_proceed(batch, &store)?;
    println!("{}", readiness.reason);
    for blocker in readiness.blocking.iter().skip(1) {
        println!(
            "  also blocking: {} ({})",
            blocker.cluster_id,
            blocker.status.map_or("not registered", |s| s.as_str())
        );
    }
    Ok(if readiness.proceed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
