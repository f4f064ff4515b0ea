//! Scheduler records.
//!
//! These types represent the persisted state of nodes, work units and
//! leases, plus the descriptors clients submit to create them. All types
//! are serializable to/from JSON for storage in redb tables and for the
//! REST API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use gilliam_core::{LeaseId, NodeId, Resources, Tick, WorkUnitId};

/// Priority given to submissions that don't specify one. Lower is more important.
pub const DEFAULT_PRIORITY: u32 = 10;

// ── Node ───────────────────────────────────────────────────────────

/// Heartbeat-derived health of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Suspect,
    Dead,
}

/// What a node submits to register.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    #[serde(default)]
    pub name: String,
    pub capacity: Resources,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A registered node and its capacity accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: Resources,
    /// Sum of capacity granted to active leases on this node.
    pub allocated: Resources,
    pub health: NodeHealth,
    pub last_heartbeat: Tick,
    pub registered_at: Tick,
}

impl Node {
    pub fn from_spec(id: NodeId, spec: NodeSpec, now: Tick) -> Self {
        Self {
            id,
            name: spec.name,
            labels: spec.labels,
            capacity: spec.capacity,
            allocated: Resources::ZERO,
            health: NodeHealth::Healthy,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn available(&self) -> Resources {
        self.capacity.saturating_sub(&self.allocated)
    }
}

// ── Work unit ──────────────────────────────────────────────────────

/// Placement constraint attached to a work unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// Node label `key` must equal `value`.
    LabelEquals { key: String, value: String },
    /// Node label `key` must exist and match the regular expression `pattern`.
    LabelMatches { key: String, pattern: String },
    /// Node must not carry label `key`.
    LabelAbsent { key: String },
    /// Node must not already host a lease for a unit in `group`.
    AntiAffinity { group: String },
    /// Node utilization after placement must stay at or below `percent`
    /// on every dimension.
    MaxUtilization { percent: u8 },
}

/// Lifecycle of a work unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Placed,
    Running,
    Failed,
    Completed,
}

impl WorkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Failed | WorkStatus::Completed)
    }

    /// Placed or running: the unit should hold a lease.
    pub fn is_leased(self) -> bool {
        matches!(self, WorkStatus::Placed | WorkStatus::Running)
    }
}

/// What a client submits to request scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkUnitSpec {
    pub demand: Resources,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Anti-affinity group this unit belongs to.
    #[serde(default)]
    pub group: Option<String>,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

impl WorkUnitSpec {
    pub fn new(demand: Resources) -> Self {
        Self {
            demand,
            constraints: Vec::new(),
            priority: DEFAULT_PRIORITY,
            group: None,
        }
    }
}

/// A submitted work unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    /// Submission order, breaks priority ties.
    pub seq: u64,
    pub demand: Resources,
    pub constraints: Vec<Constraint>,
    pub priority: u32,
    pub group: Option<String>,
    pub status: WorkStatus,
    /// Consecutive cycles in which no eligible node was found.
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub lease_id: Option<LeaseId>,
    pub node_id: Option<NodeId>,
    pub submitted_at: Tick,
    pub updated_at: Tick,
}

impl WorkUnit {
    pub fn from_spec(id: WorkUnitId, seq: u64, spec: WorkUnitSpec, now: Tick) -> Self {
        Self {
            id,
            seq,
            demand: spec.demand,
            constraints: spec.constraints,
            priority: spec.priority,
            group: spec.group,
            status: WorkStatus::Pending,
            attempts: 0,
            failure_reason: None,
            lease_id: None,
            node_id: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Return to the queue, dropping the lease binding.
    pub fn requeue(&mut self, now: Tick) {
        self.status = WorkStatus::Pending;
        self.lease_id = None;
        self.node_id = None;
        self.updated_at = now;
    }
}

// ── Lease ──────────────────────────────────────────────────────────

/// Lifecycle of a lease.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Pending,
    Active,
    Expired,
    Revoked,
    Completed,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LeaseState::Expired | LeaseState::Revoked | LeaseState::Completed
        )
    }
}

/// Time-bounded grant of capacity on a node to a work unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub id: LeaseId,
    pub work_unit_id: WorkUnitId,
    pub node_id: NodeId,
    pub granted: Resources,
    /// Anti-affinity group copied from the work unit.
    pub group: Option<String>,
    pub state: LeaseState,
    pub granted_at: Tick,
    pub expires_at: Tick,
    pub renewals: u32,
}

impl Lease {
    /// A lease is expired from its expiry tick onwards.
    pub fn is_expired_at(&self, now: Tick) -> bool {
        now >= self.expires_at
    }
}
