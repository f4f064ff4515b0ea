//! Startup reconciliation of persisted state.
//!
//! Node allocation is never trusted from disk: it is recomputed from the
//! leases that survive. Contradictions that cannot be repaired without
//! guessing (a lease on a node that does not exist, more granted capacity
//! than a node has, two leases for one unit, an unreadable record) abort
//! startup. Everything else is repaired and logged:
//!
//! - leases whose work unit is gone are dropped
//! - leases that lapsed while the scheduler was down are expired and their
//!   units requeued
//! - placed or running units without a lease are requeued
//! - every node gets a fresh heartbeat window, since none could be
//!   received while the scheduler was down

use std::collections::HashMap;

use tracing::warn;

use gilliam_core::parse_id_seq;
use gilliam_state::{Mutation, NodeId, PersistedState, Resources, Tick};

use crate::error::{SchedulerError, SchedulerResult};
use crate::ledger::Ledger;
use crate::scheduler::{LoopState, NODE_PREFIX};

/// What [`rebuild`] restored, and the records it repaired.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    pub nodes: usize,
    pub work_units: usize,
    pub leases: usize,
    pub expired_leases: usize,
    pub requeued: usize,
    pub dropped_leases: usize,
    pub next_node_seq: u64,
    pub mutations: Vec<Mutation>,
}

fn corrupt(detail: String) -> SchedulerError {
    SchedulerError::CorruptState(detail)
}

pub(crate) fn rebuild(
    persisted: PersistedState,
    ledger: &Ledger,
    state: &mut LoopState,
    now: Tick,
) -> SchedulerResult<Recovered> {
    let mut recovered = Recovered {
        next_node_seq: 1,
        ..Recovered::default()
    };

    let mut stored_allocation: HashMap<NodeId, Resources> = HashMap::new();
    for mut node in persisted.nodes {
        match parse_id_seq(NODE_PREFIX, &node.id) {
            Some(seq) => recovered.next_node_seq = recovered.next_node_seq.max(seq + 1),
            None => warn!(node = %node.id, "node has a non-standard id"),
        }
        stored_allocation.insert(node.id.clone(), node.allocated);
        node.allocated = Resources::ZERO;
        node.last_heartbeat = node.last_heartbeat.max(now);
        ledger
            .register(node)
            .map_err(|e| corrupt(e.to_string()))?;
        recovered.nodes += 1;
    }

    for unit in persisted.work_units {
        state.queue.insert(unit);
        recovered.work_units += 1;
    }

    for lease in persisted.leases {
        if lease.state.is_terminal() || state.queue.get(&lease.work_unit_id).is_none() {
            warn!(
                lease = %lease.id,
                work_unit = %lease.work_unit_id,
                state = ?lease.state,
                "dropping orphaned lease"
            );
            recovered.mutations.push(Mutation::DeleteLease(lease.id));
            recovered.dropped_leases += 1;
            continue;
        }
        if !ledger.contains(&lease.node_id) {
            return Err(corrupt(format!(
                "lease {} references unknown node {}",
                lease.id, lease.node_id
            )));
        }
        ledger
            .restore_allocation(&lease.node_id, lease.granted)
            .map_err(|e| corrupt(format!("lease {}: {e}", lease.id)))?;
        state
            .leases
            .restore(lease)
            .map_err(|e| corrupt(e.to_string()))?;
        recovered.leases += 1;
    }

    for lease in state.leases.expire_due(ledger, now) {
        recovered.expired_leases += 1;
        recovered.mutations.push(Mutation::DeleteLease(lease.id.clone()));
        if let Some(unit) = state.queue.requeue_holder(&lease, now) {
            recovered.requeued += 1;
            recovered.mutations.push(Mutation::PutWorkUnit(unit));
        }
    }

    let LoopState { queue, leases, .. } = state;
    for unit in queue.iter_mut() {
        let bound = leases.active_for_unit(&unit.id).map(|l| (l.id.clone(), l.node_id.clone()));
        match bound {
            None if unit.status.is_leased() => {
                warn!(work_unit = %unit.id, status = ?unit.status, "leased unit has no lease, requeueing");
                unit.requeue(now);
                recovered.requeued += 1;
                recovered.mutations.push(Mutation::PutWorkUnit(unit.clone()));
            }
            None if unit.lease_id.is_some() => {
                unit.lease_id = None;
                recovered.mutations.push(Mutation::PutWorkUnit(unit.clone()));
            }
            Some((lease_id, _)) if !unit.status.is_leased() => {
                // The unit moved on without its lease being closed.
                warn!(work_unit = %unit.id, lease = %lease_id, status = ?unit.status, "revoking stale lease");
                if let Ok(lease) = leases.revoke(ledger, &lease_id) {
                    recovered.mutations.push(Mutation::DeleteLease(lease.id));
                }
                if unit.lease_id.take().is_some() {
                    recovered.mutations.push(Mutation::PutWorkUnit(unit.clone()));
                }
            }
            Some((lease_id, node_id)) if unit.lease_id.as_deref() != Some(lease_id.as_str()) => {
                unit.lease_id = Some(lease_id);
                unit.node_id = Some(node_id);
                recovered.mutations.push(Mutation::PutWorkUnit(unit.clone()));
            }
            _ => {}
        }
    }

    for node in ledger.snapshot() {
        if stored_allocation.get(&node.id) != Some(&node.allocated) {
            warn!(
                node = %node.id,
                stored = ?stored_allocation.get(&node.id),
                recomputed = %node.allocated,
                "node allocation recomputed from leases"
            );
        }
        recovered.mutations.push(Mutation::PutNode(node));
    }

    Ok(recovered)
}
