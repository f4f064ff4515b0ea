//! Scheduler error types.

use thiserror::Error;

use gilliam_state::{LeaseId, NodeId, StateError, Tick, WorkStatus, WorkUnitId};

use crate::lease::LeaseError;
use crate::ledger::LedgerError;

/// Errors surfaced by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("work unit not found: {0}")]
    WorkUnitNotFound(WorkUnitId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("lease {lease_id} expired at tick {expired_at}")]
    LeaseExpired { lease_id: LeaseId, expired_at: Tick },

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("node unhealthy: {0}")]
    NodeUnhealthy(NodeId),

    #[error("work unit {work_unit_id} already holds lease {lease_id}")]
    AlreadyLeased {
        work_unit_id: WorkUnitId,
        lease_id: LeaseId,
    },

    #[error("cannot {action} work unit {id} in status {status:?}")]
    InvalidTransition {
        id: WorkUnitId,
        status: WorkStatus,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<LedgerError> for SchedulerError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NodeNotFound(id) => SchedulerError::NodeNotFound(id),
            LedgerError::NodeUnhealthy { node_id, .. } => SchedulerError::NodeUnhealthy(node_id),
            e @ LedgerError::InsufficientCapacity { .. } => {
                SchedulerError::InsufficientCapacity(e.to_string())
            }
            e @ LedgerError::AlreadyRegistered(_) => SchedulerError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<LeaseError> for SchedulerError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::LeaseNotFound(id) => SchedulerError::LeaseNotFound(id),
            LeaseError::LeaseExpired {
                lease_id,
                expired_at,
            } => SchedulerError::LeaseExpired {
                lease_id,
                expired_at,
            },
            LeaseError::AlreadyLeased {
                work_unit_id,
                lease_id,
            } => SchedulerError::AlreadyLeased {
                work_unit_id,
                lease_id,
            },
            e @ LeaseError::InvalidTtl => SchedulerError::InvalidRequest(e.to_string()),
            LeaseError::Ledger(e) => e.into(),
        }
    }
}
