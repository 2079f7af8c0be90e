//! Batch-level manual rollback.
//!
//! The CLI has no change provider, so it only moves eligible clusters into
//! `rollback_required`. The next rollout run for the batch proposes the
//! reverts and carries them through review.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use fleetguard_rollout::{RollbackCoordinator, RollbackMark, RolloutResult};
use fleetguard_state::StateStore;
use tracing::info;

use super::open_store;

const MARK_LEASE_TTL: Duration = Duration::from_secs(60);

pub fn rollback(data_dir: &Path, batch: &str, reason: &str) -> anyhow::Result<ExitCode> {
    let store = open_store(data_dir)?;
    let holder = format!("fleetguard-cli-{}", std::process::id());
    let marks = mark_batch(&store, batch, reason, &holder)?;
    if marks.is_empty() {
        eprintln!("no clusters registered in batch {batch}");
        return Ok(ExitCode::FAILURE);
    }

    let mut marked = 0usize;
    let mut busy = 0usize;
    for (cluster_id, mark) in &marks {
        match mark {
            RollbackMark::Marked => {
                marked += 1;
                println!("{cluster_id:<24} rollback_required");
            }
            RollbackMark::Ineligible(status) => {
                println!("{cluster_id:<24} skipped ({status})");
            }
            RollbackMark::Contended => {
                busy += 1;
                println!("{cluster_id:<24} busy: held by another operator");
            }
        }
    }
    info!(%batch, marked, busy, "batch marked for rollback");
    println!("{marked} of {} clusters marked for rollback", marks.len());
    Ok(if busy == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn mark_batch(
    store: &StateStore,
    batch: &str,
    reason: &str,
    holder: &str,
) -> RolloutResult<Vec<(String, RollbackMark)>> {
    store
        .query_by_batch(batch)?
        .into_iter()
        .map(|cluster| {
            let mark =
                RollbackCoordinator::mark(store, holder, MARK_LEASE_TTL, &cluster.cluster_id, reason)?;
            Ok((cluster.cluster_id, mark))
        })
        .collect()
}
