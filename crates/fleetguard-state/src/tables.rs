//! redb table definitions for the fleetguard state store.
//!
//! Cluster records and leases live in separate tables: they share the
//! cluster-id key space but are never read through each other.

use redb::TableDefinition;

/// Cluster records keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Secondary index keyed by `{batch_id}:{sequence:012}`, value is the
/// cluster id. The zero-padded sequence keeps registration order.
pub const BATCH_INDEX: TableDefinition<&str, &str> = TableDefinition::new("batch_index");

/// Counters (`batch_seq`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Ephemeral lease records keyed by `{resource_id}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Pre-change metric snapshots keyed by `{cluster_id}`.
pub const BASELINES: TableDefinition<&str, &[u8]> = TableDefinition::new("baselines");

pub(crate) const BATCH_SEQ_KEY: &str = "batch_seq";

/// Build the batch index key.
pub(crate) fn batch_index_key(batch_id: &str, seq: u64) -> String {
    format!("{batch_id}:{seq:012}")
}

/// Whether `key` is an index entry for exactly `batch_id`.
pub(crate) fn is_batch_key(key: &str, batch_id: &str) -> bool {
    key.strip_prefix(batch_id)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|seq| seq.len() == 12 && seq.bytes().all(|b| b.is_ascii_digit()))
}
