//! StateStore: redb-backed persistence for scheduler records.
//!
//! Provides typed reads over nodes, work units and leases, and a single
//! transactional write path ([`StateStore::apply`]) for state transitions.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// One record change inside an [`StateStore::apply`] batch.
#[derive(Debug, Clone)]
pub enum Mutation {
    PutNode(Node),
    DeleteNode(NodeId),
    PutWorkUnit(WorkUnit),
    DeleteWorkUnit(WorkUnitId),
    PutLease(Lease),
    DeleteLease(LeaseId),
}

/// Everything the store holds.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub nodes: Vec<Node>,
    pub work_units: Vec<WorkUnit>,
    pub leases: Vec<Lease>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.work_units.is_empty() && self.leases.is_empty()
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(WORK_UNITS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Apply a batch of mutations in one write transaction.
    pub fn apply(&self, mutations: &[Mutation]) -> StateResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut units = txn.open_table(WORK_UNITS).map_err(map_err!(Table))?;
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;

            for mutation in mutations {
                match mutation {
                    Mutation::PutNode(node) => {
                        let value = encode(node)?;
                        nodes
                            .insert(node.id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteNode(id) => {
                        nodes.remove(id.as_str()).map_err(map_err!(Write))?;
                    }
                    Mutation::PutWorkUnit(unit) => {
                        let value = encode(unit)?;
                        units
                            .insert(unit.id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteWorkUnit(id) => {
                        units.remove(id.as_str()).map_err(map_err!(Write))?;
                    }
                    Mutation::PutLease(lease) => {
                        let value = encode(lease)?;
                        leases
                            .insert(lease.id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteLease(id) => {
                        leases.remove(id.as_str()).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = mutations.len(), "mutations applied");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_node(&self, id: &str) -> StateResult<Option<Node>> {
        self.get_record(NODES, "nodes", id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_records(NODES, "nodes")
    }

    pub fn get_work_unit(&self, id: &str) -> StateResult<Option<WorkUnit>> {
        self.get_record(WORK_UNITS, "work_units", id)
    }

    pub fn list_work_units(&self) -> StateResult<Vec<WorkUnit>> {
        self.list_records(WORK_UNITS, "work_units")
    }

    pub fn get_lease(&self, id: &str) -> StateResult<Option<Lease>> {
        self.get_record(LEASES, "leases", id)
    }

    pub fn list_leases(&self) -> StateResult<Vec<Lease>> {
        self.list_records(LEASES, "leases")
    }

    /// Load every record, e.g. to rebuild scheduler state on startup.
    pub fn load(&self) -> StateResult<PersistedState> {
        let state = PersistedState {
            nodes: self.list_nodes()?,
            work_units: self.list_work_units()?,
            leases: self.list_leases()?,
        };
        debug!(
            nodes = state.nodes.len(),
            work_units = state.work_units.len(),
            leases = state.leases.len(),
            "persisted state loaded"
        );
        Ok(state)
    }

    fn get_record<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<'static, &'static str, &'static [u8]>,
        table_name: &'static str,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(table_name, key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<'static, &'static str, &'static [u8]>,
        table_name: &'static str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(table_name, key.value(), value.value())?);
        }
        Ok(results)
    }

    /// Write raw bytes under a key, bypassing serialization.
    #[cfg(test)]
    fn put_raw(
        &self,
        table_def: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
        value: &[u8],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(table: &'static str, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize {
        table,
        key: key.to_string(),
        reason: e.to_string(),
    })
}
