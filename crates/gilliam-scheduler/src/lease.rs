//! Lease manager: time-bounded grants of node capacity to work units.
//!
//! A lease is created `Pending`, becomes `Active` once its reservation is
//! committed in the [`Ledger`], and leaves the table when it is expired,
//! revoked or completed. Capacity goes back to the ledger on every exit
//! path, whether or not the work unit still exists.
//!
//! The manager itself is plain data; the scheduler serializes access to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use gilliam_core::{format_id, parse_id_seq};
use gilliam_state::{Lease, LeaseId, LeaseState, NodeId, Resources, Tick, WorkUnit, WorkUnitId};

use crate::ledger::{Ledger, LedgerError};

const LEASE_PREFIX: &str = "lease";

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("lease {lease_id} expired at tick {expired_at}")]
    LeaseExpired { lease_id: LeaseId, expired_at: Tick },

    #[error("work unit {work_unit_id} already holds lease {lease_id}")]
    AlreadyLeased {
        work_unit_id: WorkUnitId,
        lease_id: LeaseId,
    },

    #[error("lease ttl must be positive")]
    InvalidTtl,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

#[derive(Debug)]
pub struct LeaseManager {
    leases: BTreeMap<LeaseId, Lease>,
    by_unit: HashMap<WorkUnitId, LeaseId>,
    next_seq: u64,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        Self {
            leases: BTreeMap::new(),
            by_unit: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Reserve `amount` on `node_id` and bind it to `unit` until `now + ttl`.
    pub fn grant(
        &mut self,
        ledger: &Ledger,
        unit: &WorkUnit,
        node_id: &str,
        amount: Resources,
        ttl: Tick,
        now: Tick,
    ) -> LeaseResult<Lease> {
        if ttl == 0 {
            return Err(LeaseError::InvalidTtl);
        }
        if let Some(existing) = self.by_unit.get(&unit.id) {
            return Err(LeaseError::AlreadyLeased {
                work_unit_id: unit.id.clone(),
                lease_id: existing.clone(),
            });
        }

        let mut lease = Lease {
            id: format_id(LEASE_PREFIX, self.next_seq),
            work_unit_id: unit.id.clone(),
            node_id: node_id.to_string(),
            granted: amount,
            group: unit.group.clone(),
            state: LeaseState::Pending,
            granted_at: now,
            expires_at: now.saturating_add(ttl),
            renewals: 0,
        };

        let reservation = ledger.reserve(node_id, amount)?;
        self.next_seq += 1;
        lease.granted = reservation.amount();
        lease.state = LeaseState::Active;

        info!(
            lease = %lease.id,
            work_unit = %unit.id,
            node = %node_id,
            %amount,
            expires_at = lease.expires_at,
            "lease granted"
        );
        self.by_unit.insert(unit.id.clone(), lease.id.clone());
        self.leases.insert(lease.id.clone(), lease.clone());
        Ok(lease)
    }

    /// Push the expiry out to `now + ttl`.
    ///
    /// Renewing with a window that would not move the expiry later leaves
    /// the lease untouched and still succeeds, so repeated renewals are
    /// harmless.
    pub fn renew(&mut self, lease_id: &str, ttl: Tick, now: Tick) -> LeaseResult<Lease> {
        let lease = self
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| LeaseError::LeaseNotFound(lease_id.to_string()))?;

        if lease.is_expired_at(now) {
            return Err(LeaseError::LeaseExpired {
                lease_id: lease.id.clone(),
                expired_at: lease.expires_at,
            });
        }

        let expires_at = now.saturating_add(ttl);
        if expires_at <= lease.expires_at {
            debug!(lease = %lease_id, expires_at = lease.expires_at, "renewal does not extend lease");
            return Ok(lease.clone());
        }

        lease.expires_at = expires_at;
        lease.renewals += 1;
        debug!(lease = %lease_id, expires_at, renewals = lease.renewals, "lease renewed");
        Ok(lease.clone())
    }

    /// Renew every live lease held on `node_id`. Lapsed leases are left for
    /// the expiry sweep.
    pub fn renew_node(&mut self, node_id: &str, ttl: Tick, now: Tick) -> Vec<Lease> {
        let ids: Vec<LeaseId> = self
            .active_for_node(node_id)
            .into_iter()
            .filter(|l| !l.is_expired_at(now))
            .map(|l| l.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.renew(id, ttl, now).ok())
            .collect()
    }

    /// Take a lease back before its expiry.
    pub fn revoke(&mut self, ledger: &Ledger, lease_id: &str) -> LeaseResult<Lease> {
        self.finish(ledger, lease_id, LeaseState::Revoked)
    }

    /// Close a lease whose work finished.
    pub fn complete(&mut self, ledger: &Ledger, lease_id: &str) -> LeaseResult<Lease> {
        self.finish(ledger, lease_id, LeaseState::Completed)
    }

    /// Remove every lease whose expiry has passed, releasing its capacity.
    pub fn expire_due(&mut self, ledger: &Ledger, now: Tick) -> Vec<Lease> {
        let due: Vec<LeaseId> = self
            .leases
            .values()
            .filter(|l| l.is_expired_at(now))
            .map(|l| l.id.clone())
            .collect();
        due.iter()
            .filter_map(|id| self.finish(ledger, id, LeaseState::Expired).ok())
            .collect()
    }

    /// Revoke every lease on a node, e.g. once it is declared dead.
    pub fn force_release_node(&mut self, ledger: &Ledger, node_id: &str) -> Vec<Lease> {
        let held: Vec<LeaseId> = self
            .active_for_node(node_id)
            .into_iter()
            .map(|l| l.id.clone())
            .collect();
        held.iter()
            .filter_map(|id| self.revoke(ledger, id).ok())
            .collect()
    }

    fn finish(&mut self, ledger: &Ledger, lease_id: &str, state: LeaseState) -> LeaseResult<Lease> {
        let mut lease = self
            .leases
            .remove(lease_id)
            .ok_or_else(|| LeaseError::LeaseNotFound(lease_id.to_string()))?;
        if self.by_unit.get(&lease.work_unit_id) == Some(&lease.id) {
            self.by_unit.remove(&lease.work_unit_id);
        }

        ledger.release(&lease.node_id, lease.granted);
        lease.state = state;
        info!(
            lease = %lease.id,
            work_unit = %lease.work_unit_id,
            node = %lease.node_id,
            state = ?state,
            "lease closed"
        );
        Ok(lease)
    }

    /// Re-insert a persisted lease without touching the ledger.
    pub fn restore(&mut self, lease: Lease) -> LeaseResult<()> {
        if let Some(existing) = self.by_unit.get(&lease.work_unit_id) {
            return Err(LeaseError::AlreadyLeased {
                work_unit_id: lease.work_unit_id.clone(),
                lease_id: existing.clone(),
            });
        }
        match parse_id_seq(LEASE_PREFIX, &lease.id) {
            Some(seq) => self.next_seq = self.next_seq.max(seq + 1),
            None => warn!(lease = %lease.id, "restored lease has a non-standard id"),
        }
        self.by_unit
            .insert(lease.work_unit_id.clone(), lease.id.clone());
        self.leases.insert(lease.id.clone(), lease);
        Ok(())
    }

    pub fn get(&self, lease_id: &str) -> Option<&Lease> {
        self.leases.get(lease_id)
    }

    pub fn active_for_unit(&self, work_unit_id: &str) -> Option<&Lease> {
        self.by_unit
            .get(work_unit_id)
            .and_then(|id| self.leases.get(id))
    }

    pub fn active_for_node(&self, node_id: &str) -> Vec<&Lease> {
        self.leases
            .values()
            .filter(|l| l.node_id == node_id)
            .collect()
    }

    /// Anti-affinity groups hosted on each node.
    pub fn groups_by_node(&self) -> HashMap<NodeId, BTreeSet<String>> {
        let mut groups: HashMap<NodeId, BTreeSet<String>> = HashMap::new();
        for lease in self.leases.values() {
            if let Some(group) = &lease.group {
                groups
                    .entry(lease.node_id.clone())
                    .or_default()
                    .insert(group.clone());
            }
        }
        groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
