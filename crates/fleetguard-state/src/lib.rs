//! fleetguard-state — cluster registry and lease manager for fleetguard.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for cluster rollout records, batch membership, baseline metric
//! snapshots, and TTL leases.
//!
//! # Architecture
//!
//! Cluster records are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by cluster id. A secondary `{batch_id}:{seq}` index preserves
//! registration order within a batch. Lease rows live in their own table
//! and are never read as cluster records.
//!
//! All status changes are compare-and-swap writes checked against the
//! transition table in [`types::ClusterStatus::successors`]; the
//! `StateStore` is `Clone + Send + Sync` and can be shared across tasks.

pub mod clock;
pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult};
pub use lease::LeaseManager;
pub use store::{StateStore, TransitionOutcome};
pub use types::*;
