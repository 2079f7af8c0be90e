pub mod compare;
pub mod config;
pub mod registry;
pub mod rollback;

use std::path::Path;

use fleetguard_state::StateStore;

/// Open (or create) the registry under `data_dir`.
pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("fleetguard.redb");
    let store = StateStore::open(&path)?;
    tracing::debug!(path = ?path, "registry opened");
    Ok(store)
}
