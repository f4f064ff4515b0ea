//! Work queue: every work unit the scheduler knows about.
//!
//! Units stay here for their whole life; "pending" is a status, not a
//! separate container. Placement order is priority ascending, then
//! submission order.

use std::collections::BTreeMap;

use tracing::warn;

use gilliam_core::{format_id, parse_id_seq};
use gilliam_state::{Lease, Tick, WorkStatus, WorkUnit, WorkUnitId, WorkUnitSpec};

const WORK_UNIT_PREFIX: &str = "wu";

#[derive(Debug)]
pub struct WorkQueue {
    units: BTreeMap<WorkUnitId, WorkUnit>,
    next_seq: u64,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            units: BTreeMap::new(),
            next_seq: 1,
        }
    }

    /// Build the next unit from a spec without enqueuing it.
    pub fn prepare(&self, spec: WorkUnitSpec, now: Tick) -> WorkUnit {
        let seq = self.next_seq;
        WorkUnit::from_spec(format_id(WORK_UNIT_PREFIX, seq), seq, spec, now)
    }

    /// Enqueue a unit, keeping the id sequence ahead of it.
    pub fn insert(&mut self, unit: WorkUnit) {
        let seq = parse_id_seq(WORK_UNIT_PREFIX, &unit.id).unwrap_or_else(|| {
            warn!(work_unit = %unit.id, "work unit has a non-standard id");
            unit.seq
        });
        self.next_seq = self.next_seq.max(seq + 1).max(unit.seq + 1);
        self.units.insert(unit.id.clone(), unit);
    }

    pub fn get(&self, id: &str) -> Option<&WorkUnit> {
        self.units.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkUnit> {
        self.units.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<WorkUnit> {
        self.units.remove(id)
    }

    /// Send the unit bound to `lease` back to pending.
    ///
    /// Returns the updated unit, or `None` when the unit is gone, finished,
    /// or already bound to a different lease.
    pub fn requeue_holder(&mut self, lease: &Lease, now: Tick) -> Option<WorkUnit> {
        let unit = self.units.get_mut(&lease.work_unit_id)?;
        if unit.status.is_terminal() || unit.lease_id.as_deref() != Some(lease.id.as_str()) {
            return None;
        }
        unit.requeue(now);
        Some(unit.clone())
    }

    /// Ids of pending units in placement order.
    pub fn pending_in_order(&self) -> Vec<WorkUnitId> {
        let mut pending: Vec<&WorkUnit> = self
            .units
            .values()
            .filter(|u| u.status == WorkStatus::Pending)
            .collect();
        pending.sort_by_key(|u| (u.priority, u.seq));
        pending.into_iter().map(|u| u.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkUnit> {
        self.units.values_mut()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gilliam_state::Resources;

    fn spec(priority: u32) -> WorkUnitSpec {
        let mut spec = WorkUnitSpec::new(Resources::new(1, 0));
        spec.priority = priority;
        spec
    }

    fn submit(queue: &mut WorkQueue, priority: u32) -> WorkUnitId {
        let unit = queue.prepare(spec(priority), 0);
        let id = unit.id.clone();
        queue.insert(unit);
        id
    }

    #[test]
    fn ids_are_sequential() {
        let mut q = WorkQueue::new();
        assert_eq!(submit(&mut q, 10), "wu-000001");
        assert_eq!(submit(&mut q, 10), "wu-000002");
        assert_eq!(q.get("wu-000002").unwrap().seq, 2);
    }

    #[test]
    fn pending_orders_by_priority_then_submission() {
        let mut q = WorkQueue::new();
        let a = submit(&mut q, 10);
        let b = submit(&mut q, 0);
        let c = submit(&mut q, 10);
        let d = submit(&mut q, 5);
        assert_eq!(q.pending_in_order(), [b, d, a, c]);
    }

    #[test]
    fn non_pending_units_are_skipped() {
        let mut q = WorkQueue::new();
        let a = submit(&mut q, 10);
        let b = submit(&mut q, 10);
        q.get_mut(&a).unwrap().status = WorkStatus::Placed;
        assert_eq!(q.pending_in_order(), [b]);
    }

    #[test]
    fn requeue_holder_checks_binding() {
        use gilliam_state::LeaseState;

        let mut q = WorkQueue::new();
        let a = submit(&mut q, 10);
        let unit = q.get_mut(&a).unwrap();
        unit.status = WorkStatus::Placed;
        unit.lease_id = Some("lease-000002".into());
        unit.node_id = Some("node-000001".into());

        let mut lease = Lease {
            id: "lease-000001".into(),
            work_unit_id: a.clone(),
            node_id: "node-000001".into(),
            granted: Resources::new(1, 0),
            group: None,
            state: LeaseState::Expired,
            granted_at: 0,
            expires_at: 30,
            renewals: 0,
        };
        // Stale lease: the unit has moved on.
        assert!(q.requeue_holder(&lease, 30).is_none());

        lease.id = "lease-000002".into();
        let requeued = q.requeue_holder(&lease, 30).unwrap();
        assert_eq!(requeued.status, WorkStatus::Pending);
        assert!(requeued.lease_id.is_none());
        assert!(requeued.node_id.is_none());
        assert_eq!(q.pending_in_order(), [a]);
    }

    #[test]
    fn insert_keeps_sequence_ahead() {
        let mut q = WorkQueue::new();
        let mut restored = q.prepare(spec(10), 0);
        restored.id = "wu-000041".into();
        restored.seq = 41;
        q.insert(restored);
        assert_eq!(submit(&mut q, 10), "wu-000042");
    }
}
