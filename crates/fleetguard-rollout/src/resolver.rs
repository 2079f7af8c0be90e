//! Batch dependency resolver.
//!
//! Batches form a directed graph through their `prerequisites`. The graph
//! is checked once at construction (duplicates, unknown names, cycles) so
//! a bad configuration fails before any cluster is touched. At run time
//! [`DependencyResolver::can_proceed`] gates a batch on every cluster of
//! every direct prerequisite being `healthy`.

use std::collections::{BTreeSet, HashMap};

use fleetguard_state::{ClusterStatus, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::{RolloutError, RolloutResult};

/// A named group of clusters upgraded together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSpec {
    pub name: String,
    /// Clusters expected in the batch, in rollout order.
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl BatchSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            clusters: Vec::new(),
            prerequisites: Vec::new(),
        }
    }

    pub fn with_clusters(mut self, clusters: &[&str]) -> Self {
        self.clusters = clusters.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn after(mut self, prerequisite: &str) -> Self {
        self.prerequisites.push(prerequisite.to_string());
        self
    }
}

/// A cluster holding up a dependent batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocker {
    pub batch: String,
    pub cluster_id: String,
    /// `None` when the cluster is listed in config but was never registered.
    pub status: Option<ClusterStatus>,
}

/// Answer of [`DependencyResolver::can_proceed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub proceed: bool,
    pub reason: String,
    pub blocking: Vec<Blocker>,
}

/// Validated batch graph.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    batches: Vec<BatchSpec>,
    index: HashMap<String, usize>,
}

impl DependencyResolver {
    pub fn new(batches: Vec<BatchSpec>) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        for (i, batch) in batches.iter().enumerate() {
            if index.insert(batch.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateBatch(batch.name.clone()));
            }
        }
        for batch in &batches {
            for prerequisite in &batch.prerequisites {
                if !index.contains_key(prerequisite) {
                    return Err(ConfigError::UnknownPrerequisite {
                        batch: batch.name.clone(),
                        prerequisite: prerequisite.clone(),
                    });
                }
            }
        }
        let resolver = Self { batches, index };
        if let Some(cycle) = resolver.find_cycle() {
            return Err(ConfigError::CyclicBatches { cycle });
        }
        Ok(resolver)
    }

    pub fn batch(&self, name: &str) -> Option<&BatchSpec> {
        self.index.get(name).map(|&i| &self.batches[i])
    }

    pub fn batches(&self) -> &[BatchSpec] {
        &self.batches
    }

    /// Batch names with every batch after all of its prerequisites.
    /// Ties keep declaration order.
    pub fn order(&self) -> Vec<&str> {
        let mut done = vec![false; self.batches.len()];
        let mut order = Vec::with_capacity(self.batches.len());
        while order.len() < self.batches.len() {
            let ready = self.batches.iter().enumerate().find(|(i, b)| {
                !done[*i]
                    && b.prerequisites
                        .iter()
                        .all(|p| self.index.get(p).is_some_and(|&j| done[j]))
            });
            match ready {
                Some((i, batch)) => {
                    done[i] = true;
                    order.push(batch.name.as_str());
                }
                // Unreachable for a validated graph.
                None => break,
            }
        }
        order
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            resolver: &DependencyResolver,
            node: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::Active;
            path.push(node);
            for prerequisite in &resolver.batches[node].prerequisites {
                let next = resolver.index[prerequisite];
                match marks[next] {
                    Mark::Active => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|&n| resolver.batches[n].name.clone())
                            .collect();
                        cycle.push(resolver.batches[next].name.clone());
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(resolver, next, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.batches.len()];
        for node in 0..self.batches.len() {
            if marks[node] == Mark::New {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Cluster ids of a batch: the configured list in order, followed by
    /// any registered clusters the config does not mention.
    pub fn members(&self, batch_id: &str, store: &StateStore) -> RolloutResult<Vec<String>> {
        let spec = self
            .batch(batch_id)
            .ok_or_else(|| RolloutError::NotFound(format!("batch {batch_id}")))?;
        let mut members = spec.clusters.clone();
        let listed: BTreeSet<String> = members.iter().cloned().collect();
        for cluster in store.query_by_batch(batch_id)? {
            if !listed.contains(&cluster.cluster_id) {
                members.push(cluster.cluster_id);
            }
        }
        Ok(members)
    }

    /// Whether every cluster of every direct prerequisite of `batch_id`
    /// is `healthy`.
    pub fn can_proceed(&self, batch_id: &str, store: &StateStore) -> RolloutResult<Readiness> {
        let spec = self
            .batch(batch_id)
            .ok_or_else(|| RolloutError::NotFound(format!("batch {batch_id}")))?;

        if spec.prerequisites.is_empty() {
            return Ok(Readiness {
                proceed: true,
                reason: format!("batch {batch_id} has no prerequisites"),
                blocking: Vec::new(),
            });
        }

        let mut blocking = Vec::new();
        for prerequisite in &spec.prerequisites {
            let members = self.members(prerequisite, store)?;
            if members.is_empty() {
                warn!(batch = %batch_id, %prerequisite, "prerequisite batch has no clusters");
                continue;
            }
            for cluster_id in members {
                let status = store.find(&cluster_id)?.map(|c| c.status);
                if !status.is_some_and(ClusterStatus::is_terminal_success) {
                    blocking.push(Blocker {
                        batch: prerequisite.clone(),
                        cluster_id,
                        status,
                    });
                }
            }
        }

        let readiness = match blocking.first() {
            None => Readiness {
                proceed: true,
                reason: format!(
                    "all prerequisites of {batch_id} are healthy: {}",
                    spec.prerequisites.join(", ")
                ),
                blocking,
            },
            Some(first) => Readiness {
                proceed: false,
                reason: format!(
                    "prerequisite batch {} not complete: cluster {} is {}",
                    first.batch,
                    first.cluster_id,
                    first
                        .status
                        .map_or("not registered", ClusterStatus::as_str)
                ),
                blocking,
            },
        };
        debug!(batch = %batch_id, proceed = readiness.proceed, reason = %readiness.reason, "dependency check");
        Ok(readiness)
    }
}
