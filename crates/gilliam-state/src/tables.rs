//! redb table definitions for the Gilliam state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Registered nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Work units keyed by `{work_unit_id}`.
pub const WORK_UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("work_units");

/// Live leases keyed by `{lease_id}`. Terminal leases are deleted.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
