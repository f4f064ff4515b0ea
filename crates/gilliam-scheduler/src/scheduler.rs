//! Scheduler: the reconciliation loop and the operations clients call.
//!
//! Each cycle:
//! 1. Places pending work units, highest priority first, committing every
//!    decision through the lease manager.
//! 2. Expires lapsed leases, returning their units to the queue.
//! 3. Ages node health from heartbeat silence, reclaiming the leases of
//!    dead nodes.
//!
//! Every transition is written through [`StateStore::apply`]. Storage
//! failures inside a cycle are logged and the cycle carries on; client
//! operations return them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info, warn};

use gilliam_core::{Clock, GilliamConfig, HeartbeatConfig, SchedulerConfig, format_id};
use gilliam_placement::{ConstraintSet, NodeView, PlacementDecision, PlacementError, place};
use gilliam_state::{
    Lease, LeaseId, Mutation, Node, NodeHealth, NodeId, NodeSpec, StateError, StateStore, Tick,
    WorkStatus, WorkUnit, WorkUnitId, WorkUnitSpec,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::lease::{LeaseError, LeaseManager};
use crate::ledger::Ledger;
use crate::queue::WorkQueue;
use crate::rate_limit::TokenBucket;
use crate::recovery;

pub(crate) const NODE_PREFIX: &str = "node";

/// State only the loop and client operations touch, behind one lock.
#[derive(Debug, Default)]
pub(crate) struct LoopState {
    pub(crate) queue: WorkQueue,
    pub(crate) leases: LeaseManager,
    pub(crate) limiter: Option<TokenBucket>,
}

/// Outcome of committing one placement decision.
#[derive(Debug)]
enum Commit {
    Granted(Lease),
    RateLimited,
    Failed(LeaseError),
}

/// A committed placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub work_unit_id: WorkUnitId,
    pub node_id: NodeId,
    pub lease_id: LeaseId,
}

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub tick: Tick,
    pub placed: Vec<Placement>,
    /// Not placed this cycle; will be retried. Units waiting on busy or
    /// unhealthy nodes keep their attempt count.
    pub unplaced: Vec<WorkUnitId>,
    /// The chosen node changed before the lease was committed.
    pub deferred: Vec<WorkUnitId>,
    /// Out of placement attempts.
    pub failed: Vec<WorkUnitId>,
    /// Held back by the dispatch limit.
    pub rate_limited: Vec<WorkUnitId>,
    pub expired_leases: Vec<LeaseId>,
    pub requeued: Vec<WorkUnitId>,
    pub suspect_nodes: Vec<NodeId>,
    pub dead_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.placed.is_empty()
            && self.unplaced.is_empty()
            && self.deferred.is_empty()
            && self.failed.is_empty()
            && self.rate_limited.is_empty()
            && self.expired_leases.is_empty()
            && self.requeued.is_empty()
            && self.suspect_nodes.is_empty()
            && self.dead_nodes.is_empty()
            && self.removed_nodes.is_empty()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    heartbeat: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    store: StateStore,
    ledger: Ledger,
    state: Mutex<LoopState>,
    next_node_seq: AtomicU64,
    wakeup: Notify,
}

impl Scheduler {
    /// Create a scheduler with no nodes or work. Nothing is read from `store`.
    pub fn new(config: &GilliamConfig, store: StateStore, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let limiter = config
            .scheduler
            .dispatch_limit
            .map(|limit| TokenBucket::new(limit, now));
        Self {
            config: config.scheduler.clone(),
            heartbeat: config.heartbeat.clone(),
            clock,
            store,
            ledger: Ledger::new(),
            state: Mutex::new(LoopState {
                limiter,
                ..LoopState::default()
            }),
            next_node_seq: AtomicU64::new(1),
            wakeup: Notify::new(),
        }
    }

    /// Rebuild a scheduler from everything persisted in `store`.
    ///
    /// Fails with [`SchedulerError::CorruptState`] when the stored records
    /// contradict each other; the caller should refuse to start.
    pub fn recover(
        config: &GilliamConfig,
        store: StateStore,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        let persisted = store.load().map_err(|e| match e {
            e @ StateError::Deserialize { .. } => SchedulerError::CorruptState(e.to_string()),
            other => SchedulerError::State(other),
        })?;
        if persisted.is_empty() {
            info!("state store empty, starting fresh");
            return Ok(Self::new(config, store, clock));
        }

        let mut scheduler = Self::new(config, store, clock);
        let now = scheduler.clock.now();
        let recovered =
            recovery::rebuild(persisted, &scheduler.ledger, scheduler.state.get_mut(), now)?;
        scheduler
            .next_node_seq
            .store(recovered.next_node_seq, Ordering::SeqCst);
        scheduler.store.apply(&recovered.mutations)?;

        info!(
            nodes = recovered.nodes,
            work_units = recovered.work_units,
            leases = recovered.leases,
            expired_leases = recovered.expired_leases,
            requeued = recovered.requeued,
            dropped_leases = recovered.dropped_leases,
            "scheduler state recovered"
        );
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Wake the loop for an immediate cycle.
    pub fn touch(&self) {
        self.wakeup.notify_one();
    }

    // ── Work units ─────────────────────────────────────────────────

    /// Queue a work unit for placement.
    pub async fn submit(&self, spec: WorkUnitSpec) -> SchedulerResult<WorkUnit> {
        ConstraintSet::compile(&spec.constraints)
            .map_err(|e| SchedulerError::InvalidRequest(e.to_string()))?;

        let unit = {
            let mut state = self.state.lock().await;
            let unit = state.queue.prepare(spec, self.clock.now());
            self.store.apply(&[Mutation::PutWorkUnit(unit.clone())])?;
            state.queue.insert(unit.clone());
            unit
        };

        info!(
            work_unit = %unit.id,
            demand = %unit.demand,
            priority = unit.priority,
            "work unit submitted"
        );
        self.touch();
        Ok(unit)
    }

    /// Remove a work unit, revoking its lease if it holds one.
    pub async fn withdraw(&self, id: &str) -> SchedulerResult<WorkUnit> {
        let mut state = self.state.lock().await;
        let LoopState { queue, leases, .. } = &mut *state;

        let mut unit = queue
            .remove(id)
            .ok_or_else(|| SchedulerError::WorkUnitNotFound(id.to_string()))?;
        let mut mutations = vec![Mutation::DeleteWorkUnit(unit.id.clone())];
        if let Some(lease_id) = unit.lease_id.take() {
            match leases.revoke(&self.ledger, &lease_id) {
                Ok(lease) => mutations.extend(self.lease_closed(&lease)),
                Err(e) => warn!(work_unit = %id, error = %e, "withdrawn unit's lease already gone"),
            }
        }
        self.store.apply(&mutations)?;
        drop(state);

        info!(work_unit = %id, status = ?unit.status, "work unit withdrawn");
        self.touch();
        Ok(unit)
    }

    /// A node reports that it started the unit.
    pub async fn mark_running(&self, id: &str) -> SchedulerResult<WorkUnit> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let unit = state
            .queue
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkUnitNotFound(id.to_string()))?;

        match unit.status {
            WorkStatus::Placed => {
                unit.status = WorkStatus::Running;
                unit.updated_at = now;
            }
            WorkStatus::Running => return Ok(unit.clone()),
            status => {
                return Err(SchedulerError::InvalidTransition {
                    id: id.to_string(),
                    status,
                    action: "start",
                });
            }
        }

        let unit = unit.clone();
        self.store.apply(&[Mutation::PutWorkUnit(unit.clone())])?;
        info!(work_unit = %id, node = ?unit.node_id, "work unit running");
        Ok(unit)
    }

    /// A node reports that the unit finished. Its lease is closed.
    pub async fn complete(&self, id: &str) -> SchedulerResult<WorkUnit> {
        let unit = self.finish_unit(id, WorkStatus::Completed, None).await?;
        info!(work_unit = %id, "work unit completed");
        Ok(unit)
    }

    /// A node reports that the unit failed. Its lease is revoked and the
    /// unit is not retried.
    pub async fn report_failure(&self, id: &str, reason: String) -> SchedulerResult<WorkUnit> {
        let unit = self
            .finish_unit(id, WorkStatus::Failed, Some(reason))
            .await?;
        warn!(work_unit = %id, reason = ?unit.failure_reason, "work unit failed on node");
        Ok(unit)
    }

    async fn finish_unit(
        &self,
        id: &str,
        status: WorkStatus,
        reason: Option<String>,
    ) -> SchedulerResult<WorkUnit> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let LoopState { queue, leases, .. } = &mut *state;

        let unit = queue
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkUnitNotFound(id.to_string()))?;
        if !unit.status.is_leased() {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                status: unit.status,
                action: if status == WorkStatus::Completed {
                    "complete"
                } else {
                    "fail"
                },
            });
        }

        let mut mutations = Vec::new();
        if let Some(lease_id) = unit.lease_id.take() {
            let closed = if status == WorkStatus::Completed {
                leases.complete(&self.ledger, &lease_id)
            } else {
                leases.revoke(&self.ledger, &lease_id)
            };
            match closed {
                Ok(lease) => mutations.extend(self.lease_closed(&lease)),
                Err(e) => warn!(work_unit = %id, error = %e, "unit's lease already gone"),
            }
        }
        unit.status = status;
        unit.failure_reason = reason;
        unit.updated_at = now;
        let unit = unit.clone();
        mutations.push(Mutation::PutWorkUnit(unit.clone()));

        self.store.apply(&mutations)?;
        drop(state);
        self.touch();
        Ok(unit)
    }

    pub async fn work_unit(&self, id: &str) -> SchedulerResult<WorkUnit> {
        self.state
            .lock()
            .await
            .queue
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::WorkUnitNotFound(id.to_string()))
    }

    pub async fn list_work_units(&self) -> Vec<WorkUnit> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub async fn register_node(&self, spec: NodeSpec) -> SchedulerResult<Node> {
        if spec.capacity.is_zero() {
            return Err(SchedulerError::InvalidRequest(
                "node capacity must be non-zero".to_string(),
            ));
        }

        let seq = self.next_node_seq.fetch_add(1, Ordering::SeqCst);
        let mut node = Node::from_spec(format_id(NODE_PREFIX, seq), spec, self.clock.now());
        if node.name.is_empty() {
            node.name = node.id.clone();
        }

        self.store.apply(&[Mutation::PutNode(node.clone())])?;
        self.ledger.register(node.clone())?;

        info!(
            node = %node.id,
            name = %node.name,
            capacity = %node.capacity,
            labels = node.labels.len(),
            "node registered"
        );
        self.touch();
        Ok(node)
    }

    /// Record a heartbeat. With `renew_on_heartbeat`, every live lease on
    /// the node is extended by the default TTL.
    pub async fn heartbeat(&self, node_id: &str) -> SchedulerResult<Node> {
        let now = self.clock.now();
        let (_, previous) = self
            .ledger
            .record_heartbeat(node_id, now)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;

        let mut state = self.state.lock().await;
        let node = self
            .ledger
            .get(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;
        let mut mutations = vec![Mutation::PutNode(node.clone())];
        if self.config.renew_on_heartbeat {
            let renewed = state
                .leases
                .renew_node(node_id, self.config.default_lease_ttl, now);
            mutations.extend(renewed.into_iter().map(Mutation::PutLease));
        }
        self.store.apply(&mutations)?;
        drop(state);

        if previous != NodeHealth::Healthy {
            info!(node = %node_id, from = ?previous, "node healthy again");
            self.touch();
        } else {
            debug!(node = %node_id, tick = now, "heartbeat");
        }
        Ok(node)
    }

    /// Remove a node, revoking its leases and requeueing their units.
    pub async fn deregister_node(&self, node_id: &str) -> SchedulerResult<Node> {
        let mut state = self.state.lock().await;
        if !self.ledger.contains(node_id) {
            return Err(SchedulerError::NodeNotFound(node_id.to_string()));
        }
        let now = self.clock.now();

        let (mut mutations, requeued) = self.reclaim_node(&mut state, node_id, now);
        let node = self
            .ledger
            .deregister(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;
        mutations.retain(|m| !matches!(m, Mutation::PutNode(n) if n.id == node_id));
        mutations.push(Mutation::DeleteNode(node.id.clone()));
        self.store.apply(&mutations)?;
        drop(state);

        info!(node = %node_id, requeued = requeued.len(), "node deregistered");
        if !requeued.is_empty() {
            self.touch();
        }
        Ok(node)
    }

    pub fn node(&self, id: &str) -> SchedulerResult<Node> {
        self.ledger
            .get(id)
            .ok_or_else(|| SchedulerError::NodeNotFound(id.to_string()))
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.ledger.snapshot()
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Extend a lease by `ttl` ticks, or the default TTL.
    pub async fn renew_lease(&self, lease_id: &str, ttl: Option<Tick>) -> SchedulerResult<Lease> {
        let ttl = ttl.unwrap_or(self.config.default_lease_ttl);
        if ttl == 0 {
            return Err(SchedulerError::InvalidRequest(
                "lease ttl must be positive".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let lease = state.leases.renew(lease_id, ttl, self.clock.now())?;
        self.store.apply(&[Mutation::PutLease(lease.clone())])?;
        Ok(lease)
    }

    pub async fn lease(&self, id: &str) -> SchedulerResult<Lease> {
        self.state
            .lock()
            .await
            .leases
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::LeaseNotFound(id.to_string()))
    }

    pub async fn list_leases(&self) -> Vec<Lease> {
        self.state.lock().await.leases.iter().cloned().collect()
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Run one reconciliation cycle at the current tick.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut report = CycleReport {
            tick: now,
            ..CycleReport::default()
        };

        self.place_pending(&mut state, now, &mut report);
        self.sweep_leases(&mut state, now, &mut report);
        self.sweep_nodes(&mut state, now, &mut report);
        drop(state);

        if report.is_idle() {
            debug!(tick = now, "cycle idle");
        } else {
            info!(
                tick = now,
                placed = report.placed.len(),
                unplaced = report.unplaced.len(),
                failed = report.failed.len(),
                expired_leases = report.expired_leases.len(),
                dead_nodes = report.dead_nodes.len(),
                "cycle complete"
            );
        }
        report
    }

    /// Run cycles until `shutdown` flips to true or its sender is dropped.
    ///
    /// Cycles run every `cycle_interval_ms`, or straight away after
    /// [`Scheduler::touch`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.cycle_interval();
        info!(interval_ms = self.config.cycle_interval_ms, "scheduler loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wakeup.notified() => {
                    debug!("scheduler woken early");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("scheduler loop stopped");
    }

    fn place_pending(&self, state: &mut LoopState, now: Tick, report: &mut CycleReport) {
        let order = state.queue.pending_in_order();
        if order.is_empty() {
            return;
        }
        let LoopState {
            queue,
            leases,
            limiter,
        } = state;

        let groups = leases.groups_by_node();
        let mut views: Vec<NodeView> = self
            .ledger
            .snapshot()
            .into_iter()
            .map(|node| {
                let groups = groups.get(&node.id).cloned().unwrap_or_default();
                NodeView { node, groups }
            })
            .collect();

        for (position, unit_id) in order.iter().enumerate() {
            let Some(unit) = queue.get(unit_id).cloned() else {
                continue;
            };

            let decision = match place(&unit, &views, self.config.packing) {
                Ok(decision) => decision,
                Err(PlacementError::InsufficientCapacity { reason, .. }) => {
                    debug!(work_unit = %unit_id, %reason, "waiting for capacity");
                    report.unplaced.push(unit_id.clone());
                    continue;
                }
                Err(PlacementError::NoEligibleNode { reason, .. }) => {
                    self.record_failed_attempt(queue, unit_id, reason, now, report);
                    continue;
                }
                Err(PlacementError::InvalidConstraint { source, .. }) => {
                    self.fail_unplaceable(queue, unit_id, format!("invalid constraint: {source}"), now);
                    report.failed.push(unit_id.clone());
                    continue;
                }
            };

            match self.commit(leases, limiter, &unit, &decision, now) {
                Commit::RateLimited => {
                    debug!(held_back = order.len() - position, "dispatch limit reached");
                    report.rate_limited.extend(order[position..].iter().cloned());
                    break;
                }
                Commit::Granted(lease) => {
                    let Some(entry) = queue.get_mut(unit_id) else {
                        continue;
                    };
                    entry.status = WorkStatus::Placed;
                    entry.lease_id = Some(lease.id.clone());
                    entry.node_id = Some(lease.node_id.clone());
                    entry.attempts = 0;
                    entry.failure_reason = None;
                    entry.updated_at = now;

                    let mut mutations = vec![
                        Mutation::PutWorkUnit(entry.clone()),
                        Mutation::PutLease(lease.clone()),
                    ];
                    if let Some(node) = self.ledger.get(&lease.node_id) {
                        refresh_view(&mut views, node.clone(), lease.group.as_deref());
                        mutations.push(Mutation::PutNode(node));
                    }
                    self.persist(&mutations);

                    report.placed.push(Placement {
                        work_unit_id: unit_id.clone(),
                        node_id: lease.node_id,
                        lease_id: lease.id,
                    });
                }
                Commit::Failed(e) => {
                    warn!(
                        work_unit = %unit_id,
                        node = %decision.node_id,
                        error = %e,
                        "placement not committed, retrying next cycle"
                    );
                    match self.ledger.get(&decision.node_id) {
                        Some(node) => refresh_view(&mut views, node, None),
                        None => views.retain(|v| v.node.id != decision.node_id),
                    }
                    report.deferred.push(unit_id.clone());
                }
            }
        }
    }

    /// Grant the lease for a decision. A dispatch token is only spent once
    /// the grant succeeds.
    fn commit(
        &self,
        leases: &mut LeaseManager,
        limiter: &mut Option<TokenBucket>,
        unit: &WorkUnit,
        decision: &PlacementDecision,
        now: Tick,
    ) -> Commit {
        if limiter
            .as_mut()
            .is_some_and(|bucket| bucket.available(now) == 0)
        {
            return Commit::RateLimited;
        }
        let granted = leases.grant(
            &self.ledger,
            unit,
            &decision.node_id,
            decision.amount,
            self.config.default_lease_ttl,
            now,
        );
        match granted {
            Ok(lease) => {
                if let Some(bucket) = limiter.as_mut() {
                    bucket.try_acquire(now);
                }
                Commit::Granted(lease)
            }
            Err(e) => Commit::Failed(e),
        }
    }

    fn record_failed_attempt(
        &self,
        queue: &mut WorkQueue,
        unit_id: &str,
        reason: String,
        now: Tick,
        report: &mut CycleReport,
    ) {
        let Some(unit) = queue.get_mut(unit_id) else {
            return;
        };
        unit.attempts += 1;
        unit.updated_at = now;

        if unit.attempts >= self.config.max_placement_attempts {
            unit.status = WorkStatus::Failed;
            unit.failure_reason = Some(format!(
                "no eligible node after {} attempts: {reason}",
                unit.attempts
            ));
            warn!(work_unit = %unit_id, attempts = unit.attempts, %reason, "work unit failed placement");
            report.failed.push(unit_id.to_string());
        } else {
            debug!(work_unit = %unit_id, attempts = unit.attempts, %reason, "no eligible node");
            unit.failure_reason = Some(reason);
            report.unplaced.push(unit_id.to_string());
        }
        let record = Mutation::PutWorkUnit(unit.clone());
        self.persist(&[record]);
    }

    fn fail_unplaceable(&self, queue: &mut WorkQueue, unit_id: &str, reason: String, now: Tick) {
        let Some(unit) = queue.get_mut(unit_id) else {
            return;
        };
        warn!(work_unit = %unit_id, %reason, "work unit can never be placed");
        unit.status = WorkStatus::Failed;
        unit.failure_reason = Some(reason);
        unit.updated_at = now;
        let record = Mutation::PutWorkUnit(unit.clone());
        self.persist(&[record]);
    }

    fn sweep_leases(&self, state: &mut LoopState, now: Tick, report: &mut CycleReport) {
        let LoopState { queue, leases, .. } = state;
        for lease in leases.expire_due(&self.ledger, now) {
            let mut mutations = self.lease_closed(&lease);
            if let Some(unit) = queue.requeue_holder(&lease, now) {
                info!(work_unit = %unit.id, lease = %lease.id, "lease expired, work unit requeued");
                report.requeued.push(unit.id.clone());
                mutations.push(Mutation::PutWorkUnit(unit));
            }
            self.persist(&mutations);
            report.expired_leases.push(lease.id);
        }
    }

    fn sweep_nodes(&self, state: &mut LoopState, now: Tick, report: &mut CycleReport) {
        let hb = &self.heartbeat;
        for node in self.ledger.snapshot() {
            let silent = now.saturating_sub(node.last_heartbeat);
            match node.health {
                NodeHealth::Dead => {
                    let expired = hb
                        .remove_dead_after
                        .is_some_and(|grace| silent > hb.dead_after.saturating_add(grace));
                    if expired {
                        self.remove_dead_node(state, &node.id, now, report);
                    }
                }
                _ if silent > hb.dead_after => {
                    if self
                        .ledger
                        .transition_if_silent(&node.id, NodeHealth::Dead, hb.dead_after, now)
                        .is_none()
                    {
                        continue;
                    }
                    let (mutations, requeued) = self.reclaim_node(state, &node.id, now);
                    warn!(
                        node = %node.id,
                        silent_ticks = silent,
                        requeued = requeued.len(),
                        "node declared dead"
                    );
                    self.persist(&mutations);
                    report.dead_nodes.push(node.id.clone());
                    report.requeued.extend(requeued);
                }
                NodeHealth::Healthy if silent > hb.suspect_after => {
                    if let Some(suspect) = self.ledger.transition_if_silent(
                        &node.id,
                        NodeHealth::Suspect,
                        hb.suspect_after,
                        now,
                    ) {
                        warn!(node = %node.id, silent_ticks = silent, "node suspect");
                        self.persist(&[Mutation::PutNode(suspect)]);
                        report.suspect_nodes.push(node.id.clone());
                    }
                }
                _ => {}
            }
        }
    }

    fn remove_dead_node(
        &self,
        state: &mut LoopState,
        node_id: &str,
        now: Tick,
        report: &mut CycleReport,
    ) {
        // A heartbeat may have revived it since the snapshot.
        let hb = &self.heartbeat;
        let grace = hb.remove_dead_after.unwrap_or_default();
        if self
            .ledger
            .deregister_if_dead(node_id, hb.dead_after.saturating_add(grace), now)
            .is_none()
        {
            return;
        }
        // Leases were reclaimed when the node died; catch any stragglers.
        let (mut mutations, requeued) = self.reclaim_node(state, node_id, now);
        mutations.push(Mutation::DeleteNode(node_id.to_string()));
        self.persist(&mutations);

        info!(node = %node_id, "dead node removed");
        report.removed_nodes.push(node_id.to_string());
        report.requeued.extend(requeued);
    }

    /// Revoke every lease on a node and requeue the units holding them.
    fn reclaim_node(
        &self,
        state: &mut LoopState,
        node_id: &str,
        now: Tick,
    ) -> (Vec<Mutation>, Vec<WorkUnitId>) {
        let mut mutations = Vec::new();
        let mut requeued = Vec::new();
        for lease in state.leases.force_release_node(&self.ledger, node_id) {
            mutations.push(Mutation::DeleteLease(lease.id.clone()));
            if let Some(unit) = state.queue.requeue_holder(&lease, now) {
                requeued.push(unit.id.clone());
                mutations.push(Mutation::PutWorkUnit(unit));
            }
        }
        if let Some(node) = self.ledger.get(node_id) {
            mutations.push(Mutation::PutNode(node));
        }
        (mutations, requeued)
    }

    /// Records to write after a lease leaves the table.
    fn lease_closed(&self, lease: &Lease) -> Vec<Mutation> {
        let mut mutations = vec![Mutation::DeleteLease(lease.id.clone())];
        if let Some(node) = self.ledger.get(&lease.node_id) {
            mutations.push(Mutation::PutNode(node));
        }
        mutations
    }

    fn persist(&self, mutations: &[Mutation]) {
        if let Err(e) = self.store.apply(mutations) {
            error!(error = %e, records = mutations.len(), "failed to persist scheduler state");
        }
    }
}

/// Bring a node's view up to date after this cycle changed it.
fn refresh_view(views: &mut [NodeView], node: Node, group: Option<&str>) {
    if let Some(view) = views.iter_mut().find(|v| v.node.id == node.id) {
        view.node = node;
        if let Some(group) = group {
            view.groups.insert(group.to_string());
        }
    }
}
