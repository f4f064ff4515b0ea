//! Node scoring for placement decisions.
//!
//! A node is eligible when it is healthy, has room for the demand on every
//! dimension, and satisfies the unit's constraints. Eligible nodes are then
//! ordered by the packing policy:
//!
//! - **Best fit**: prefer the node that will be most allocated after
//!   placement, then the one leaving the smallest residual capacity.
//! - **Spread**: the reverse, least allocated first.
//!
//! Remaining ties go to the lowest node id. All arithmetic is integer so the
//! ordering is deterministic.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use gilliam_core::{PackingPolicy, cmp_ids};
use gilliam_state::{Node, NodeHealth, NodeId, Resources};

use crate::constraint::ConstraintSet;

const PPM: u128 = 1_000_000;

/// A node as seen by the placement engine.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub node: Node,
    /// Anti-affinity groups that hold an active lease on this node.
    pub groups: BTreeSet<String>,
}

impl NodeView {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            groups: BTreeSet::new(),
        }
    }
}

/// Why a node was not eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unhealthy,
    InsufficientCapacity,
    Constraint,
}

/// Scored eligible node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Mean utilization after placement, in parts per million.
    pub utilization_ppm: u64,
    /// Capacity left over after placement, summed across dimensions.
    pub residual: u64,
}

/// Mean projected utilization over dimensions with non-zero capacity.
pub fn projected_utilization_ppm(node: &Node, demand: &Resources) -> u64 {
    let projected = node.allocated.saturating_add(demand);
    let dims: Vec<u128> = projected
        .dimensions(&node.capacity)
        .iter()
        .filter(|(_, cap)| *cap > 0)
        .map(|(used, cap)| (u128::from(*used) * PPM / u128::from(*cap)).min(PPM))
        .collect();
    if dims.is_empty() {
        return 0;
    }
    (dims.iter().sum::<u128>() / dims.len() as u128) as u64
}

/// Score a single node, or say why it cannot take the demand.
pub fn score_node(
    view: &NodeView,
    demand: &Resources,
    constraints: &ConstraintSet,
) -> Result<NodeScore, Rejection> {
    let node = &view.node;
    if node.health != NodeHealth::Healthy {
        return Err(Rejection::Unhealthy);
    }
    let available = node.available();
    if !demand.fits_within(&available) {
        return Err(Rejection::InsufficientCapacity);
    }
    if !constraints.admits(view, demand) {
        return Err(Rejection::Constraint);
    }

    let left = available.saturating_sub(demand);
    Ok(NodeScore {
        node_id: node.id.clone(),
        utilization_ppm: projected_utilization_ppm(node, demand),
        residual: left.cpu.saturating_add(left.memory),
    })
}

/// Whether `view` could take `demand` once it is healthy and idle.
///
/// Label constraints never change; anti-affinity and utilization caps are
/// judged against the node with nothing allocated. A `false` here for every
/// node means waiting will not help.
pub fn could_ever_host(view: &NodeView, demand: &Resources, constraints: &ConstraintSet) -> bool {
    if !demand.fits_within(&view.node.capacity) {
        return false;
    }
    let idle = NodeView {
        node: Node {
            allocated: Resources::ZERO,
            health: NodeHealth::Healthy,
            ..view.node.clone()
        },
        groups: BTreeSet::new(),
    };
    constraints.admits(&idle, demand)
}

/// Order two scores under a policy; `Less` means "preferred".
pub fn compare(a: &NodeScore, b: &NodeScore, policy: PackingPolicy) -> Ordering {
    let by_packing = match policy {
        PackingPolicy::BestFit => b
            .utilization_ppm
            .cmp(&a.utilization_ppm)
            .then(a.residual.cmp(&b.residual)),
        PackingPolicy::Spread => a
            .utilization_ppm
            .cmp(&b.utilization_ppm)
            .then(b.residual.cmp(&a.residual)),
    };
    by_packing.then_with(|| cmp_ids(&a.node_id, &b.node_id))
}

/// Score all nodes and return the eligible ones, best first.
pub fn rank_nodes(
    views: &[NodeView],
    demand: &Resources,
    constraints: &ConstraintSet,
    policy: PackingPolicy,
) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = views
        .iter()
        .filter_map(|v| score_node(v, demand, constraints).ok())
        .collect();
    scores.sort_by(|a, b| compare(a, b, policy));
    scores
}
