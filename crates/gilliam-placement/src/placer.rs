//! Placement: picks a node for one work unit.
//!
//! Filters the snapshot by health, free capacity and constraints, ranks
//! what is left with the packing policy, and returns the best node. The
//! decision is advisory: nothing is reserved until the scheduler commits
//! it through the lease manager.
//!
//! A failed placement says whether waiting can help. `InsufficientCapacity`
//! means some node could host the unit once it is healthy and has room;
//! `NoEligibleNode` means none ever could.

use thiserror::Error;
use tracing::{debug, trace};

use gilliam_core::PackingPolicy;
use gilliam_state::{NodeId, Resources, WorkUnit, WorkUnitId};

use crate::constraint::{ConstraintError, ConstraintSet};
use crate::scorer::{NodeScore, NodeView, Rejection, compare, could_ever_host, score_node};

/// The node chosen for a work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub work_unit_id: WorkUnitId,
    pub node_id: NodeId,
    pub amount: Resources,
    pub score: NodeScore,
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no eligible node for {work_unit_id}: {reason}")]
    NoEligibleNode {
        work_unit_id: WorkUnitId,
        reason: String,
    },

    #[error("no node has room for {work_unit_id} right now: {reason}")]
    InsufficientCapacity {
        work_unit_id: WorkUnitId,
        reason: String,
    },

    #[error("invalid constraint on {work_unit_id}: {source}")]
    InvalidConstraint {
        work_unit_id: WorkUnitId,
        #[source]
        source: ConstraintError,
    },
}

/// Per-reason count of rejected nodes, used to explain a failed placement.
#[derive(Debug, Default)]
struct RejectionTally {
    unhealthy: usize,
    insufficient: usize,
    constraint: usize,
}

impl RejectionTally {
    fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::Unhealthy => self.unhealthy += 1,
            Rejection::InsufficientCapacity => self.insufficient += 1,
            Rejection::Constraint => self.constraint += 1,
        }
    }

    fn describe(&self, total: usize, demand: &Resources) -> String {
        if total == 0 {
            return "no nodes registered".to_string();
        }
        format!(
            "{total} nodes considered for {demand}: {} unhealthy, {} without capacity, {} failing constraints",
            self.unhealthy, self.insufficient, self.constraint
        )
    }
}

/// Choose a node for `unit` from the given snapshot.
pub fn place(
    unit: &WorkUnit,
    nodes: &[NodeView],
    policy: PackingPolicy,
) -> Result<PlacementDecision, PlacementError> {
    let constraints =
        ConstraintSet::compile(&unit.constraints).map_err(|source| {
            PlacementError::InvalidConstraint {
                work_unit_id: unit.id.clone(),
                source,
            }
        })?;

    let mut tally = RejectionTally::default();
    let mut best: Option<NodeScore> = None;

    for view in nodes {
        match score_node(view, &unit.demand, &constraints) {
            Ok(score) => {
                trace!(
                    work_unit = %unit.id,
                    node = %score.node_id,
                    utilization_ppm = score.utilization_ppm,
                    residual = score.residual,
                    "candidate node"
                );
                let better = best
                    .as_ref()
                    .is_none_or(|current| compare(&score, current, policy).is_lt());
                if better {
                    best = Some(score);
                }
            }
            Err(rejection) => tally.record(rejection),
        }
    }

    match best {
        Some(score) => {
            debug!(
                work_unit = %unit.id,
                node = %score.node_id,
                utilization_ppm = score.utilization_ppm,
                "placement selected"
            );
            Ok(PlacementDecision {
                work_unit_id: unit.id.clone(),
                node_id: score.node_id.clone(),
                amount: unit.demand,
                score,
            })
        }
        None => {
            let work_unit_id = unit.id.clone();
            let reason = tally.describe(nodes.len(), &unit.demand);
            if nodes
                .iter()
                .any(|view| could_ever_host(view, &unit.demand, &constraints))
            {
                Err(PlacementError::InsufficientCapacity {
                    work_unit_id,
                    reason,
                })
            } else {
                Err(PlacementError::NoEligibleNode {
                    work_unit_id,
                    reason,
                })
            }
        }
    }
}
