//! StateStore — redb-backed cluster registry for fleetguard.
//!
//! Holds one record per cluster keyed by cluster id, a batch index that
//! preserves registration order, persisted baseline snapshots, and the
//! lease table the [`LeaseManager`](crate::LeaseManager) is built on.
//!
//! Every status change goes through [`StateStore::transition_with`], which
//! performs the compare-and-swap, the transition-table check, and the
//! lease fence check inside a single redb write transaction. redb
//! serializes write transactions, so two callers racing on the same
//! record cannot both observe the expected status.

use std::path::Path;
use std::sync::Arc;

use fleetguard_validation::MetricsSnapshot;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Result of a conditional write against a cluster record.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The write was applied; carries the record as stored.
    Applied(Cluster),
    /// The stored status did not match the expected one. Nothing was written.
    Conflict { actual: ClusterStatus },
    /// The presented fence no longer matches the live lease. Nothing was written.
    Fenced,
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn into_cluster(self) -> Option<Cluster> {
        match self {
            Self::Applied(cluster) => Some(cluster),
            _ => None,
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Unavailable))?;
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Unavailable))?;
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the time source used for timestamps and lease expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Unavailable))?;
        txn.open_table(BATCH_INDEX).map_err(map_err!(Unavailable))?;
        txn.open_table(META).map_err(map_err!(Unavailable))?;
        txn.open_table(LEASES).map_err(map_err!(Unavailable))?;
        txn.open_table(BASELINES).map_err(map_err!(Unavailable))?;
        txn.commit().map_err(map_err!(Unavailable))?;
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert a new cluster record and append it to its batch index.
    ///
    /// Fails with `AlreadyExists` if the id is taken; an existing record is
    /// never overwritten.
    pub fn register(&self, mut cluster: Cluster) -> StateResult<Cluster> {
        cluster.last_updated_ms = self.clock.now_ms();
        let value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
        let id = cluster.cluster_id.clone();

        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let duplicate = {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Unavailable))?;
            if clusters
                .get(id.as_str())
                .map_err(map_err!(Unavailable))?
                .is_some()
            {
                true
            } else {
                let mut meta = txn.open_table(META).map_err(map_err!(Unavailable))?;
                let seq = meta
                    .get(BATCH_SEQ_KEY)
                    .map_err(map_err!(Unavailable))?
                    .map(|g| g.value())
                    .unwrap_or(0)
                    + 1;
                meta.insert(BATCH_SEQ_KEY, seq)
                    .map_err(map_err!(Unavailable))?;

                let mut index = txn.open_table(BATCH_INDEX).map_err(map_err!(Unavailable))?;
                let key = batch_index_key(&cluster.batch_id, seq);
                index
                    .insert(key.as_str(), id.as_str())
                    .map_err(map_err!(Unavailable))?;
                clusters
                    .insert(id.as_str(), value.as_slice())
                    .map_err(map_err!(Unavailable))?;
                false
            }
        };

        if duplicate {
            txn.abort().map_err(map_err!(Unavailable))?;
            warn!(cluster_id = %id, "cluster already registered");
            return Err(StateError::AlreadyExists(id));
        }
        txn.commit().map_err(map_err!(Unavailable))?;
        info!(cluster_id = %id, batch = %cluster.batch_id, "cluster registered");
        Ok(cluster)
    }

    /// Get a cluster by id, or `None` if it was never registered.
    pub fn find(&self, cluster_id: &str) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Unavailable))?;
        match table.get(cluster_id).map_err(map_err!(Unavailable))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Get a cluster by id.
    pub fn get(&self, cluster_id: &str) -> StateResult<Cluster> {
        self.find(cluster_id)?
            .ok_or_else(|| StateError::NotFound(cluster_id.to_string()))
    }

    /// All clusters, ordered by id.
    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Unavailable))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Unavailable))? {
            let (_, value) = entry.map_err(map_err!(Unavailable))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Clusters of a batch in registration order.
    pub fn query_by_batch(&self, batch_id: &str) -> StateResult<Vec<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let index = txn.open_table(BATCH_INDEX).map_err(map_err!(Unavailable))?;
        let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Unavailable))?;
        let mut results = Vec::new();
        for entry in index.iter().map_err(map_err!(Unavailable))? {
            let (key, id) = entry.map_err(map_err!(Unavailable))?;
            if !is_batch_key(key.value(), batch_id) {
                continue;
            }
            let id = id.value();
            match clusters.get(id).map_err(map_err!(Unavailable))? {
                Some(guard) => results.push(decode(guard.value())?),
                None => warn!(cluster_id = %id, batch = %batch_id, "batch index entry without record"),
            }
        }
        Ok(results)
    }

    /// Compare-and-swap the status of a cluster.
    ///
    /// Returns `false` without writing when the stored status is not
    /// `expected`.
    pub fn transition(
        &self,
        cluster_id: &str,
        expected: ClusterStatus,
        new: ClusterStatus,
    ) -> StateResult<bool> {
        self.transition_with(cluster_id, expected, new, None, |_| {})
            .map(|outcome| outcome.applied())
    }

    /// Compare-and-swap with an optional lease fence and a record update.
    ///
    /// In one write transaction: the edge must be in the transition table,
    /// the stored status must equal `expected`, and, when `fence` is given,
    /// the fence must still match the live lease on the cluster. Only then
    /// is `mutate` applied, the status set, `version` bumped, and
    /// `last_updated_ms` stamped.
    pub fn transition_with<F>(
        &self,
        cluster_id: &str,
        expected: ClusterStatus,
        new: ClusterStatus,
        fence: Option<&Fence>,
        mutate: F,
    ) -> StateResult<TransitionOutcome>
    where
        F: FnOnce(&mut Cluster),
    {
        if !expected.can_transition_to(new) {
            warn!(%cluster_id, from = %expected, to = %new, "transition rejected: not in table");
            return Err(StateError::InvalidTransition {
                from: expected,
                to: new,
            });
        }
        self.write_cluster(cluster_id, expected, new, fence, mutate)
    }

    /// Conditional update of rollout fields that keeps the status.
    ///
    /// Same checks as [`transition_with`](Self::transition_with) minus the
    /// table check. Used to record errors and refs while parked in a phase.
    pub fn annotate<F>(
        &self,
        cluster_id: &str,
        expected: ClusterStatus,
        fence: Option<&Fence>,
        mutate: F,
    ) -> StateResult<TransitionOutcome>
    where
        F: FnOnce(&mut Cluster),
    {
        self.write_cluster(cluster_id, expected, expected, fence, mutate)
    }

    fn write_cluster<F>(
        &self,
        cluster_id: &str,
        expected: ClusterStatus,
        new: ClusterStatus,
        fence: Option<&Fence>,
        mutate: F,
    ) -> StateResult<TransitionOutcome>
    where
        F: FnOnce(&mut Cluster),
    {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let outcome = {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Unavailable))?;
            let leases = txn.open_table(LEASES).map_err(map_err!(Unavailable))?;

            let stored = clusters
                .get(cluster_id)
                .map_err(map_err!(Unavailable))?
                .map(|g| g.value().to_vec());
            let lease: Option<Lease> = match leases.get(cluster_id).map_err(map_err!(Unavailable))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            match stored {
                None => None,
                Some(bytes) => {
                    let mut cluster: Cluster = decode(&bytes)?;
                    if cluster.status != expected {
                        Some(TransitionOutcome::Conflict {
                            actual: cluster.status,
                        })
                    } else if fence.is_some_and(|f| !lease.as_ref().is_some_and(|l| f.admits(l, now))) {
                        Some(TransitionOutcome::Fenced)
                    } else {
                        let (id, batch) = (cluster.cluster_id.clone(), cluster.batch_id.clone());
                        mutate(&mut cluster);
                        cluster.cluster_id = id;
                        cluster.batch_id = batch;
                        cluster.status = new;
                        cluster.version += 1;
                        cluster.last_updated_ms = now;
                        if let (Some(fence), Some(lease)) = (fence, lease.as_ref()) {
                            cluster.lease_holder = Some(fence.holder.clone());
                            cluster.lease_expires_at_ms = Some(lease.expires_at_ms);
                        }
                        let value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
                        clusters
                            .insert(cluster_id, value.as_slice())
                            .map_err(map_err!(Unavailable))?;
                        Some(TransitionOutcome::Applied(cluster))
                    }
                }
            }
        };

        match outcome {
            Some(TransitionOutcome::Applied(cluster)) => {
                txn.commit().map_err(map_err!(Unavailable))?;
                info!(
                    %cluster_id,
                    from = %expected,
                    to = %new,
                    version = cluster.version,
                    "cluster transitioned"
                );
                Ok(TransitionOutcome::Applied(cluster))
            }
            Some(rejected) => {
                txn.abort().map_err(map_err!(Unavailable))?;
                warn!(%cluster_id, from = %expected, to = %new, outcome = ?rejected, "transition not applied");
                Ok(rejected)
            }
            None => {
                txn.abort().map_err(map_err!(Unavailable))?;
                Err(StateError::NotFound(cluster_id.to_string()))
            }
        }
    }

    // ── Baselines ──────────────────────────────────────────────────

    /// Persist the pre-change snapshot for a cluster, replacing any earlier one.
    pub fn put_baseline(&self, cluster_id: &str, snapshot: &MetricsSnapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        {
            let mut table = txn.open_table(BASELINES).map_err(map_err!(Unavailable))?;
            table
                .insert(cluster_id, value.as_slice())
                .map_err(map_err!(Unavailable))?;
        }
        txn.commit().map_err(map_err!(Unavailable))?;
        debug!(%cluster_id, metrics = snapshot.len(), "baseline stored");
        Ok(())
    }

    pub fn get_baseline(&self, cluster_id: &str) -> StateResult<Option<MetricsSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(BASELINES).map_err(map_err!(Unavailable))?;
        match table.get(cluster_id).map_err(map_err!(Unavailable))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn get_lease(&self, resource_id: &str) -> StateResult<Option<Lease>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Unavailable))?;
        match table.get(resource_id).map_err(map_err!(Unavailable))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Conditional write on a lease row.
    ///
    /// `decide` sees the stored lease (if any) and the current time inside
    /// a write transaction. Returning `Some(lease)` writes it; `None` leaves
    /// the row untouched.
    pub fn modify_lease<T, F>(&self, resource_id: &str, decide: F) -> StateResult<T>
    where
        F: FnOnce(Option<Lease>, u64) -> (Option<Lease>, T),
    {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let (written, result) = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Unavailable))?;
            let current: Option<Lease> = match table.get(resource_id).map_err(map_err!(Unavailable))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let (next, result) = decide(current, now);
            let written = match next {
                Some(lease) => {
                    let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table
                        .insert(resource_id, value.as_slice())
                        .map_err(map_err!(Unavailable))?;
                    true
                }
                None => false,
            };
            (written, result)
        };
        if written {
            txn.commit().map_err(map_err!(Unavailable))?;
        } else {
            txn.abort().map_err(map_err!(Unavailable))?;
        }
        Ok(result)
    }
}
