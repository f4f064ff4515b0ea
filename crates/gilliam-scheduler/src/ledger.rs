//! Resource ledger: authoritative record of node capacity and allocation.
//!
//! Each node sits behind its own mutex, so reservations against different
//! nodes never contend and a reservation is atomic with respect to every
//! other reservation or release on the same node. The outer map lock is
//! only held long enough to look a node up, or to insert or remove one.
//!
//! The ledger never lets `allocated` exceed `capacity` on any dimension:
//! [`Ledger::reserve`] checks and commits under the node lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use gilliam_core::{PackingPolicy, cmp_ids};
use gilliam_placement::{ConstraintSet, NodeView, rank_nodes};
use gilliam_state::{Node, NodeHealth, NodeId, Resources, Tick};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node already registered: {0}")]
    AlreadyRegistered(NodeId),

    #[error("node {node_id} is {health:?}")]
    NodeUnhealthy { node_id: NodeId, health: NodeHealth },

    #[error("insufficient capacity on {node_id}: requested {requested}, available {available}")]
    InsufficientCapacity {
        node_id: NodeId,
        requested: Resources,
        available: Resources,
    },
}

/// Capacity that has been committed against a node.
///
/// Returned by [`Ledger::reserve`]; the lease manager turns it into a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    node_id: NodeId,
    amount: Resources,
}

impl Reservation {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn amount(&self) -> Resources {
        self.amount
    }
}

type NodeSlot = Arc<Mutex<Node>>;

#[derive(Debug, Default)]
pub struct Ledger {
    nodes: RwLock<BTreeMap<NodeId, NodeSlot>>,
}

fn lock(slot: &NodeSlot) -> MutexGuard<'_, Node> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, node_id: &str) -> Option<NodeSlot> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    fn slots(&self) -> Vec<NodeSlot> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Add a node. Its `allocated` figure is taken as given.
    pub fn register(&self, node: Node) -> Result<(), LedgerError> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.contains_key(&node.id) {
            return Err(LedgerError::AlreadyRegistered(node.id));
        }
        debug!(node = %node.id, capacity = %node.capacity, "node added to ledger");
        nodes.insert(node.id.clone(), Arc::new(Mutex::new(node)));
        Ok(())
    }

    /// Remove a node, returning its final record.
    pub fn deregister(&self, node_id: &str) -> Option<Node> {
        let slot = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id)?;
        let node = lock(&slot).clone();
        Some(node)
    }

    /// Remove a node only if it is still dead and has been silent for more
    /// than `threshold` ticks. A heartbeat that lands first keeps it.
    pub fn deregister_if_dead(&self, node_id: &str, threshold: Tick, now: Tick) -> Option<Node> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let node = {
            let slot = nodes.get(node_id)?;
            let node = lock(slot);
            let silent = now.saturating_sub(node.last_heartbeat);
            if node.health != NodeHealth::Dead || silent <= threshold {
                return None;
            }
            node.clone()
        };
        nodes.remove(node_id);
        debug!(node = %node_id, "dead node deregistered");
        Some(node)
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.slot(node_id).map(|slot| lock(&slot).clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.slot(node_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every node, ordered by id.
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.slots().iter().map(|slot| lock(slot).clone()).collect();
        nodes.sort_by(|a, b| cmp_ids(&a.id, &b.id));
        nodes
    }

    /// Healthy nodes that could take `demand` right now, best first.
    pub fn candidates(&self, demand: &Resources, policy: PackingPolicy) -> Vec<Node> {
        let views: Vec<NodeView> = self.snapshot().into_iter().map(NodeView::new).collect();
        rank_nodes(&views, demand, &ConstraintSet::default(), policy)
            .into_iter()
            .filter_map(|score| {
                views
                    .iter()
                    .find(|v| v.node.id == score.node_id)
                    .map(|v| v.node.clone())
            })
            .collect()
    }

    /// Atomically check and commit `amount` against a healthy node.
    pub fn reserve(&self, node_id: &str, amount: Resources) -> Result<Reservation, LedgerError> {
        let slot = self
            .slot(node_id)
            .ok_or_else(|| LedgerError::NodeNotFound(node_id.to_string()))?;
        let mut node = lock(&slot);

        if node.health != NodeHealth::Healthy {
            return Err(LedgerError::NodeUnhealthy {
                node_id: node_id.to_string(),
                health: node.health,
            });
        }
        let available = node.available();
        if !amount.fits_within(&available) {
            return Err(LedgerError::InsufficientCapacity {
                node_id: node_id.to_string(),
                requested: amount,
                available,
            });
        }

        node.allocated = node.allocated.saturating_add(&amount);
        debug!(node = %node_id, %amount, allocated = %node.allocated, "capacity reserved");
        Ok(Reservation {
            node_id: node_id.to_string(),
            amount,
        })
    }

    /// Commit `amount` regardless of health, still refusing to overcommit.
    ///
    /// Used when rebuilding allocation from persisted leases.
    pub fn restore_allocation(&self, node_id: &str, amount: Resources) -> Result<(), LedgerError> {
        let slot = self
            .slot(node_id)
            .ok_or_else(|| LedgerError::NodeNotFound(node_id.to_string()))?;
        let mut node = lock(&slot);
        let available = node.available();
        if !amount.fits_within(&available) {
            return Err(LedgerError::InsufficientCapacity {
                node_id: node_id.to_string(),
                requested: amount,
                available,
            });
        }
        node.allocated = node.allocated.saturating_add(&amount);
        Ok(())
    }

    /// Return capacity to a node. Unknown nodes are ignored.
    ///
    /// Returns the updated node so the caller can persist it.
    pub fn release(&self, node_id: &str, amount: Resources) -> Option<Node> {
        let Some(slot) = self.slot(node_id) else {
            warn!(node = %node_id, %amount, "release for unknown node ignored");
            return None;
        };
        let mut node = lock(&slot);
        if !amount.fits_within(&node.allocated) {
            warn!(
                node = %node_id,
                %amount,
                allocated = %node.allocated,
                "release exceeds allocation, clamping at zero"
            );
        }
        node.allocated = node.allocated.saturating_sub(&amount);
        debug!(node = %node_id, %amount, allocated = %node.allocated, "capacity released");
        Some(node.clone())
    }

    /// Record a heartbeat. Suspect and dead nodes come back as healthy.
    ///
    /// Returns the updated node and the health it had before.
    pub fn record_heartbeat(&self, node_id: &str, now: Tick) -> Option<(Node, NodeHealth)> {
        let slot = self.slot(node_id)?;
        let mut node = lock(&slot);
        let previous = node.health;
        node.last_heartbeat = node.last_heartbeat.max(now);
        node.health = NodeHealth::Healthy;
        Some((node.clone(), previous))
    }

    pub fn set_health(&self, node_id: &str, health: NodeHealth) -> Option<Node> {
        let slot = self.slot(node_id)?;
        let mut node = lock(&slot);
        node.health = health;
        Some(node.clone())
    }

    /// Move a node to `health` if it has been silent for more than
    /// `threshold` ticks, re-checking under the node lock so a heartbeat
    /// that raced the health sweep wins.
    pub fn transition_if_silent(
        &self,
        node_id: &str,
        health: NodeHealth,
        threshold: Tick,
        now: Tick,
    ) -> Option<Node> {
        let slot = self.slot(node_id)?;
        let mut node = lock(&slot);
        let silent = now.saturating_sub(node.last_heartbeat);
        if silent <= threshold || node.health == health {
            return None;
        }
        node.health = health;
        Some(node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::thread;

    use gilliam_state::NodeSpec;

    fn node(id: &str, cpu: u64, memory: u64) -> Node {
        Node::from_spec(
            id.to_string(),
            NodeSpec {
                name: id.to_string(),
                capacity: Resources::new(cpu, memory),
                labels: BTreeMap::new(),
            },
            0,
        )
    }

    #[test]
    fn reserve_and_release() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 8)).unwrap();

        let r = ledger.reserve("node-000001", Resources::new(3, 2)).unwrap();
        assert_eq!(r.node_id(), "node-000001");
        assert_eq!(r.amount(), Resources::new(3, 2));
        assert_eq!(ledger.get("node-000001").unwrap().allocated, Resources::new(3, 2));

        let after = ledger.release("node-000001", Resources::new(3, 2)).unwrap();
        assert_eq!(after.allocated, Resources::ZERO);
    }

    #[test]
    fn reserve_refuses_overcommit() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 8)).unwrap();
        let _held = ledger.reserve("node-000001", Resources::new(3, 0)).unwrap();

        let err = ledger.reserve("node-000001", Resources::new(2, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity { .. }));
        let err = ledger.reserve("node-000001", Resources::new(0, 9)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity { .. }));
        assert_eq!(ledger.get("node-000001").unwrap().allocated, Resources::new(3, 0));
    }

    #[test]
    fn reserve_requires_healthy_known_node() {
        let ledger = Ledger::new();
        assert!(matches!(
            ledger.reserve("node-000009", Resources::new(1, 0)),
            Err(LedgerError::NodeNotFound(_))
        ));

        ledger.register(node("node-000001", 4, 0)).unwrap();
        ledger.set_health("node-000001", NodeHealth::Suspect);
        assert!(matches!(
            ledger.reserve("node-000001", Resources::new(1, 0)),
            Err(LedgerError::NodeUnhealthy { health: NodeHealth::Suspect, .. })
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        assert!(matches!(
            ledger.register(node("node-000001", 8, 0)),
            Err(LedgerError::AlreadyRegistered(_))
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn release_unknown_node_is_noop() {
        let ledger = Ledger::new();
        assert!(ledger.release("node-000001", Resources::new(1, 0)).is_none());
    }

    #[test]
    fn release_clamps_at_zero() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        let _r = ledger.reserve("node-000001", Resources::new(1, 0)).unwrap();
        let after = ledger.release("node-000001", Resources::new(3, 0)).unwrap();
        assert_eq!(after.allocated, Resources::ZERO);
    }

    #[test]
    fn heartbeat_revives_dead_node() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        ledger.set_health("node-000001", NodeHealth::Dead);

        let (updated, previous) = ledger.record_heartbeat("node-000001", 42).unwrap();
        assert_eq!(previous, NodeHealth::Dead);
        assert_eq!(updated.health, NodeHealth::Healthy);
        assert_eq!(updated.last_heartbeat, 42);
        assert!(ledger.record_heartbeat("node-000002", 42).is_none());
    }

    #[test]
    fn transition_if_silent_respects_recent_heartbeat() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        ledger.record_heartbeat("node-000001", 20);

        assert!(
            ledger
                .transition_if_silent("node-000001", NodeHealth::Suspect, 10, 30)
                .is_none()
        );
        let moved = ledger
            .transition_if_silent("node-000001", NodeHealth::Suspect, 10, 31)
            .unwrap();
        assert_eq!(moved.health, NodeHealth::Suspect);
        // Already suspect: no second transition.
        assert!(
            ledger
                .transition_if_silent("node-000001", NodeHealth::Suspect, 10, 40)
                .is_none()
        );
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let ledger = Ledger::new();
        ledger.register(node("node-000002", 4, 0)).unwrap();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        let ids: Vec<_> = ledger.snapshot().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, ["node-000001", "node-000002"]);
    }

    #[test]
    fn snapshot_orders_wide_ids_after_padded_ones() {
        let ledger = Ledger::new();
        ledger.register(node("node-1000000", 4, 0)).unwrap();
        ledger.register(node("node-999999", 4, 0)).unwrap();
        let ids: Vec<_> = ledger.snapshot().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, ["node-999999", "node-1000000"]);
    }

    #[test]
    fn deregister_if_dead_keeps_revived_node() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        ledger.set_health("node-000001", NodeHealth::Dead);

        // Not silent long enough yet.
        assert!(ledger.deregister_if_dead("node-000001", 40, 40).is_none());

        // A heartbeat arrives before the removal check.
        ledger.record_heartbeat("node-000001", 45).unwrap();
        assert!(ledger.deregister_if_dead("node-000001", 40, 100).is_none());
        assert!(ledger.contains("node-000001"));

        ledger.set_health("node-000001", NodeHealth::Dead);
        let removed = ledger.deregister_if_dead("node-000001", 40, 100).unwrap();
        assert_eq!(removed.id, "node-000001");
        assert!(!ledger.contains("node-000001"));
        assert!(ledger.deregister_if_dead("node-000001", 40, 100).is_none());
    }

    #[test]
    fn candidates_skip_full_and_unhealthy_nodes() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        ledger.register(node("node-000002", 2, 0)).unwrap();
        ledger.register(node("node-000003", 8, 0)).unwrap();
        ledger.set_health("node-000003", NodeHealth::Dead);

        let ids: Vec<_> = ledger
            .candidates(&Resources::new(3, 0), PackingPolicy::BestFit)
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, ["node-000001"]);
    }

    #[test]
    fn restore_allocation_detects_overcommit() {
        let ledger = Ledger::new();
        ledger.register(node("node-000001", 4, 0)).unwrap();
        ledger.set_health("node-000001", NodeHealth::Suspect);

        ledger.restore_allocation("node-000001", Resources::new(3, 0)).unwrap();
        assert!(ledger.restore_allocation("node-000001", Resources::new(2, 0)).is_err());
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let ledger = Arc::new(Ledger::new());
        ledger.register(node("node-000001", 10, 0)).unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || ledger.reserve("node-000001", Resources::new(1, 0)).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 10);
        let n = ledger.get("node-000001").unwrap();
        assert_eq!(n.allocated, n.capacity);
    }
}
