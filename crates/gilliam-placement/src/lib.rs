//! Gilliam placement engine — constraint filtering and bin-packing.
//!
//! Placement is a pure function of a ledger snapshot and a work unit. It
//! never mutates capacity; the scheduler commits a decision through the
//! lease manager, which re-validates capacity atomically.
//!
//! # Components
//!
//! - **`constraint`**: compiled constraint predicates (labels, anti-affinity, utilization cap)
//! - **`scorer`**: eligibility checks and packing order
//! - **`placer`**: picks one node for one work unit

pub mod constraint;
pub mod placer;
pub mod scorer;

pub use constraint::{ConstraintError, ConstraintSet};
pub use placer::{PlacementDecision, PlacementError, place};
pub use scorer::{NodeScore, NodeView, Rejection, could_ever_host, rank_nodes, score_node};
