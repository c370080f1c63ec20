use consensus::{CommittedDecision, Consensus, GroupId, NodeId, TransitionId};
use network::{
    ActiveSetRequest, ActiveSetResponse, DemandReport, Envelope, FailureEvent, Liveness,
    LoadReport, NetworkMessage, PeerStatus, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use storage::{
    ActiveState, ProgressTracker, RecordLocks, RecordState, RecordStore, RemovalRequest, Stage,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::active::ActiveReplicas;
use crate::decision::ControlDecision;
use crate::driver::{spawn_periodic, Direction, DriverContext, DriverOutcome, TransitionDriver};
use crate::election::elect_leader;
use crate::placement::{self, PlacementContext, PlacementPolicy};
use crate::{Config, ControllerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed,
    NotFound,
    AlreadyPending,
    /// The primary group could not order the request.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOutcome {
    pub name: String,
    pub primaries: BTreeSet<NodeId>,
    pub actives: BTreeSet<NodeId>,
    pub proposed: bool,
}

/// Applies agreed reconfiguration decisions for the names this node is a
/// primary of, and turns acknowledgments and failure notifications into new
/// proposals or drivers.
pub struct ReconfigurationCoordinator {
    config: Config,
    store: Arc<dyn RecordStore>,
    locks: RecordLocks,
    consensus: Arc<dyn Consensus>,
    transport: Arc<dyn Transport>,
    liveness: Arc<dyn Liveness>,
    placement: Box<dyn PlacementPolicy>,
    progress: ProgressTracker,
    actives: ActiveReplicas,
    loads: RwLock<HashMap<NodeId, f64>>,
    pending_removals: Mutex<HashMap<Uuid, oneshot::Sender<RemoveOutcome>>>,
    drivers: Mutex<Vec<JoinHandle<DriverOutcome>>>,
}

impl ReconfigurationCoordinator {
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        consensus: Arc<dyn Consensus>,
        transport: Arc<dyn Transport>,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            placement: placement::policy_for(config.placement),
            actives: ActiveReplicas::new(config.node_id),
            config,
            store,
            locks: RecordLocks::new(),
            consensus,
            transport,
            liveness,
            progress: ProgressTracker::new(),
            loads: RwLock::new(HashMap::new()),
            pending_removals: Mutex::new(HashMap::new()),
            drivers: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn liveness(&self) -> &Arc<dyn Liveness> {
        &self.liveness
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn actives(&self) -> &ActiveReplicas {
        &self.actives
    }

    pub fn leader_for(&self, primaries: &BTreeSet<NodeId>) -> Option<NodeId> {
        elect_leader(primaries, self.liveness.as_ref())
    }

    pub async fn record(&self, name: &str) -> Result<Option<RecordState>> {
        Ok(self.store.get(name).await?)
    }

    /// Current active set of `name`, as exposed to the lookup path.
    pub async fn active_set(&self, name: &str) -> Result<Option<BTreeSet<NodeId>>> {
        Ok(self
            .store
            .get(name)
            .await?
            .map(|record| record.active_set().clone()))
    }

    pub fn primaries_for(&self, name: &str) -> BTreeSet<NodeId> {
        placement::primaries_for(name, &self.config.nodes, self.config.num_primaries)
    }

    /// Creates `name` with its hash-assigned primaries.
    pub async fn add_record(&self, name: &str) -> Result<AddOutcome> {
        let primaries = self.primaries_for(name);
        self.add_record_with_primaries(name, primaries).await
    }

    pub async fn add_record_with_primaries(
        &self,
        name: &str,
        primaries: BTreeSet<NodeId>,
    ) -> Result<AddOutcome> {
        if !primaries.contains(&self.config.node_id) {
            return Err(ControllerError::NotPrimary {
                name: name.to_string(),
                node: self.config.node_id,
            });
        }

        if let Some(existing) = self.store.get(name).await? {
            tracing::debug!("Record {} already exists", name);
            return Ok(AddOutcome {
                name: name.to_string(),
                primaries: existing.primaries().clone(),
                actives: existing.active_set().clone(),
                proposed: false,
            });
        }

        let group = GroupId::primary(name);
        self.consensus.create_group(group.clone(), primaries.clone()).await?;

        let actives = placement::initial_actives(
            name,
            &self.config.nodes,
            &primaries,
            self.config.min_replica,
        );
        let decision = ControlDecision::AddRecord {
            name: name.to_string(),
            primaries: primaries.clone(),
            actives: actives.clone(),
            transition_id: TransitionId::generate(),
            proposer: self.config.node_id,
        };
        let proposed = self.propose(&group, &decision).await?;

        Ok(AddOutcome {
            name: name.to_string(),
            primaries,
            actives,
            proposed,
        })
    }

    /// Membership for the next generation of `record`, `count` members,
    /// keeping clear of its primaries where possible.
    pub fn select_actives(&self, record: &RecordState, count: usize) -> BTreeSet<NodeId> {
        let loads = self.loads.read().unwrap_or_else(|e| e.into_inner()).clone();
        let ranked_voters = record.ranked_voters();
        let ctx = PlacementContext {
            name: record.name(),
            nodes: &self.config.nodes,
            current_actives: record.active_set(),
            ranked_voters: &ranked_voters,
            loads: &loads,
            liveness: Some(self.liveness.as_ref()),
        };
        self.placement
            .select_membership(&ctx, count, record.primaries())
    }

    /// Proposes `actives` as the next generation of `record`. Returns the
    /// new transition id when the proposal was accepted for ordering.
    pub async fn propose_new_actives(
        &self,
        record: &RecordState,
        actives: BTreeSet<NodeId>,
    ) -> Result<Option<TransitionId>> {
        let transition_id = TransitionId::generate();
        let decision = ControlDecision::NewActives {
            name: record.name().to_string(),
            actives,
            transition_id,
            proposer: self.config.node_id,
        };

        if self.propose(&GroupId::primary(record.name()), &decision).await? {
            Ok(Some(transition_id))
        } else {
            Ok(None)
        }
    }

    /// Starts the removal of `name`. The receiver resolves once the record
    /// is torn down or the request is refused.
    pub async fn request_removal(&self, name: &str) -> Result<oneshot::Receiver<RemoveOutcome>> {
        let (tx, rx) = oneshot::channel();

        let record = match self.store.get(name).await? {
            Some(record) => record,
            None => {
                let _ = tx.send(RemoveOutcome::NotFound);
                return Ok(rx);
            }
        };

        if record.is_marked_for_removal() {
            let _ = tx.send(RemoveOutcome::AlreadyPending);
            return Ok(rx);
        }

        let request_id = Uuid::new_v4();
        {
            let mut pending = self.pending_removals.lock().unwrap_or_else(|e| e.into_inner());
            // Waiters that gave up, such as timed-out HTTP requests.
            pending.retain(|_, waiter| !waiter.is_closed());
            pending.insert(request_id, tx);
        }

        let decision = ControlDecision::MarkRemoved {
            name: name.to_string(),
            request_id,
            requested_by: self.config.node_id,
        };
        match self.propose(&GroupId::primary(name), &decision).await {
            Ok(true) => {}
            Ok(false) => self.resolve_removal(request_id, RemoveOutcome::Unavailable),
            Err(e) => {
                self.resolve_removal(request_id, RemoveOutcome::Unavailable);
                return Err(e);
            }
        }

        Ok(rx)
    }

    /// Local demand bookkeeping; not agreed through consensus.
    pub async fn record_demand(&self, report: &DemandReport) -> Result<bool> {
        let _guard = self.locks.lock(&report.name).await;
        let mut record = match self.store.get(&report.name).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        record.record_demand(report.reporter, report.lookups, report.updates);
        self.store.put(record).await?;
        Ok(true)
    }

    /// Closes the demand round of `name` and returns the updated record.
    pub async fn roll_demand_window(&self, name: &str) -> Result<Option<RecordState>> {
        let _guard = self.locks.lock(name).await;
        let mut record = match self.store.get(name).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let (lookup_rate, update_rate) = record.demand.roll_window();
        tracing::trace!(
            "Demand for {}: lookup rate {:.2}, update rate {:.2}",
            name,
            lookup_rate,
            update_rate
        );
        self.store.put(record.clone()).await?;
        Ok(Some(record))
    }

    /// Latest load reported by `report.from`, consulted by load-balanced
    /// placement.
    pub fn record_load(&self, report: &LoadReport) {
        self.loads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(report.from, report.requests_per_sec);
    }

    pub async fn run(self: Arc<Self>, mut decisions: mpsc::UnboundedReceiver<CommittedDecision>) {
        tracing::info!("Coordinator on node {} applying decisions", self.config.node_id);
        while let Some(decision) = decisions.recv().await {
            self.handle_decision(decision).await;
        }
        tracing::warn!("Decision stream for node {} closed", self.config.node_id);
    }

    pub async fn watch_failures(self: Arc<Self>) {
        let mut events = self.liveness.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => self.handle_failure_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} failure events, rescanning records", skipped);
                    if let Err(e) = self.resume_in_flight().await {
                        tracing::error!("Failed to resume records: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn handle_decision(&self, committed: CommittedDecision) {
        let decision = match ControlDecision::decode(&committed.payload) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    "Dropping malformed decision in {} slot {}: {}",
                    committed.group,
                    committed.slot,
                    e
                );
                return;
            }
        };

        let kind = decision.kind();
        let name = decision.name().to_string();
        tracing::debug!(
            "Node {} applying {} for {} (slot {})",
            self.config.node_id,
            kind,
            name,
            committed.slot
        );

        let result = match decision {
            ControlDecision::AddRecord {
                name,
                primaries,
                actives,
                transition_id,
                proposer,
            } => {
                self.apply_add_record(&name, primaries, actives, transition_id, proposer)
                    .await
            }
            ControlDecision::NewActives {
                name,
                actives,
                transition_id,
                proposer,
            } => {
                self.apply_new_actives(&name, actives, transition_id, proposer)
                    .await
            }
            ControlDecision::StopConfirmed {
                name,
                transition_id,
                confirmed_by,
            } => {
                self.apply_stop_confirmed(&name, transition_id, confirmed_by)
                    .await
            }
            ControlDecision::StartConfirmed {
                name,
                transition_id,
                confirmed_by,
            } => {
                self.apply_start_confirmed(&name, transition_id, confirmed_by)
                    .await
            }
            ControlDecision::MarkRemoved {
                name,
                request_id,
                requested_by,
            } => {
                self.apply_mark_removed(&name, request_id, requested_by)
                    .await
            }
            ControlDecision::Teardown { name, .. } => self.apply_teardown(&name).await,
        };

        if let Err(e) = result {
            tracing::error!("Failed to apply {} for {}: {}", kind, name, e);
        }
    }

    pub async fn handle_message(&self, envelope: Envelope) {
        let from = envelope.from;
        let result = match envelope.message {
            NetworkMessage::StartActiveSet(request) => {
                self.relay_change(Direction::Start, request).await
            }
            NetworkMessage::StopActiveSet(request) => {
                self.relay_change(Direction::Stop, request).await
            }
            NetworkMessage::StartMember(request) => {
                let response = self.actives.handle_start(&request).await;
                self.transport
                    .send(from, NetworkMessage::MemberStarted(response))
                    .await
                    .map_err(ControllerError::from)
            }
            NetworkMessage::StopMember(request) => {
                let response = self.actives.handle_stop(&request).await;
                self.transport
                    .send(from, NetworkMessage::MemberStopped(response))
                    .await
                    .map_err(ControllerError::from)
            }
            NetworkMessage::MemberStarted(response) | NetworkMessage::MemberStopped(response) => {
                if self.actives.record_member_ack(&response) {
                    self.answer_settled_relays().await
                } else {
                    tracing::debug!(
                        "Acknowledgment for {} from node {} no longer awaited",
                        response.group,
                        response.responder
                    );
                    Ok(())
                }
            }
            NetworkMessage::ActiveSetStopped(response) => self.on_stop_acknowledged(response).await,
            NetworkMessage::ActiveSetStarted(response) => self.on_start_acknowledged(response).await,
            NetworkMessage::DemandReport(report) => self.record_demand(&report).await.map(|_| ()),
            NetworkMessage::NameServerLoad(report) => {
                self.record_load(&report);
                Ok(())
            }
            NetworkMessage::Ping(_) | NetworkMessage::Pong(_) => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!("Failed to handle message from node {}: {}", from, e);
        }
    }

    pub async fn handle_failure_event(&self, event: FailureEvent) {
        if event.status == PeerStatus::Up {
            tracing::debug!("Node {} is up", event.node);
            return;
        }

        // A crashed member no longer serves, so stops waiting on it settle.
        if let Err(e) = self.answer_settled_relays().await {
            tracing::warn!("Failed to answer settled relays: {}", e);
        }

        let records = match self.store.scan_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Failed to scan records after failure of {}: {}", event.node, e);
                return;
            }
        };

        let local = self.config.node_id;
        for record in records {
            if record.is_primary(local) && record.is_primary(event.node) {
                tracing::info!(
                    "Primary {} of {} failed, resuming from {:?}",
                    event.node,
                    record.name(),
                    record.compute_state()
                );
                if let Err(e) = self.recover_record(&record).await {
                    tracing::error!("Failed to resume {}: {}", record.name(), e);
                }
            }
        }
    }

    /// Re-drives every unfinished record this node leads. Used at start-up
    /// and whenever failure events may have been missed. Primary groups of
    /// loaded records are rejoined first. A record that cannot be resumed is
    /// logged and skipped.
    pub async fn resume_in_flight(&self) -> Result<usize> {
        let local = self.config.node_id;
        let mut resumed = 0;
        for record in self.store.scan_all().await? {
            if !record.is_primary(local) {
                continue;
            }
            let group = GroupId::primary(record.name());
            if let Err(e) = self
                .consensus
                .create_group(group.clone(), record.primaries().clone())
                .await
            {
                tracing::error!("Failed to rejoin {}: {}", group, e);
                continue;
            }

            let unfinished = record.is_marked_for_removal()
                || record.compute_state() != ActiveState::ActiveRunning;
            if !unfinished || self.leader_for(record.primaries()) != Some(local) {
                continue;
            }
            match self.recover_record(&record).await {
                Ok(()) => resumed += 1,
                Err(e) => tracing::error!("Failed to resume {}: {}", record.name(), e),
            }
        }
        Ok(resumed)
    }

    /// Issues whatever step `record` is waiting for, derived from its state
    /// alone.
    pub async fn recover_record(&self, record: &RecordState) -> Result<()> {
        let state = record.compute_state();
        match (state, record.is_marked_for_removal()) {
            (ActiveState::OldActiveRunning, _) => {
                self.spawn_driver(TransitionDriver::stop_old(record, self.driver_context()));
            }
            (ActiveState::NoActiveRunning, false) => {
                self.spawn_driver(TransitionDriver::start_new(record, self.driver_context()));
            }
            (ActiveState::NoActiveRunning, true) => {
                self.propose_teardown(record.name()).await?;
            }
            (ActiveState::ActiveRunning, true) => {
                self.spawn_driver(TransitionDriver::stop_current(record, self.driver_context()));
            }
            (ActiveState::ActiveRunning, false) => {}
            (ActiveState::Conflict, _) => {
                tracing::error!("CONFLICT: not resuming {}", record.name());
            }
        }
        Ok(())
    }

    /// Aborts every driver this node started.
    pub fn shutdown(&self) {
        let drivers = std::mem::take(&mut *self.drivers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in drivers {
            handle.abort();
        }
    }

    /// Removal requests still waiting for their acknowledgment.
    pub fn pending_removals(&self) -> usize {
        self.pending_removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn running_drivers(&self) -> usize {
        let mut drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        drivers.retain(|handle| !handle.is_finished());
        drivers.len()
    }

    async fn apply_add_record(
        &self,
        name: &str,
        primaries: BTreeSet<NodeId>,
        actives: BTreeSet<NodeId>,
        transition_id: TransitionId,
        proposer: NodeId,
    ) -> Result<()> {
        let record = {
            let _guard = self.locks.lock(name).await;
            if self.store.get(name).await?.is_some() {
                tracing::debug!("Record {} already added", name);
                return Ok(());
            }
            let record = RecordState::new(
                name,
                primaries,
                actives,
                transition_id,
                self.config.moving_average_window,
            );
            self.store.put(record.clone()).await?;
            record
        };

        tracing::info!(
            "Added record {} with primaries {:?} and actives {:?}",
            name,
            record.primaries(),
            record.active_set()
        );

        if self.should_drive(proposer, record.primaries()) {
            self.spawn_driver(TransitionDriver::start_new(&record, self.driver_context()));
        }
        Ok(())
    }

    async fn apply_new_actives(
        &self,
        name: &str,
        actives: BTreeSet<NodeId>,
        transition_id: TransitionId,
        proposer: NodeId,
    ) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        let mut record = match self.store.get(name).await? {
            Some(record) => record,
            None => {
                tracing::warn!("New actives for {} but the record is gone", name);
                return Ok(());
            }
        };

        if record.is_marked_for_removal() {
            tracing::info!("Ignoring new actives for {}: marked for removal", name);
            if record.compute_state() == ActiveState::ActiveRunning
                && self.should_drive(proposer, record.primaries())
            {
                self.spawn_driver(TransitionDriver::stop_current(&record, self.driver_context()));
            }
            return Ok(());
        }

        if record.active_transition_id() == transition_id {
            tracing::debug!("New actives {} for {} already applied", transition_id, name);
            return Ok(());
        }

        if let Err(e) = record.begin_transition(actives, transition_id) {
            tracing::info!("Not applying new actives for {}: {}", name, e);
            return Ok(());
        }
        self.store.put(record.clone()).await?;
        self.progress.complete(name);
        self.progress.advance(name, Stage::StopSent);

        tracing::info!(
            "Reconfiguring {}: {:?} ({}) -> {:?} ({})",
            name,
            record.old_active_set(),
            record.old_transition_id(),
            record.active_set(),
            record.active_transition_id()
        );

        if self.should_drive(proposer, record.primaries()) {
            self.spawn_driver(TransitionDriver::stop_old(&record, self.driver_context()));
        }
        Ok(())
    }

    async fn apply_stop_confirmed(
        &self,
        name: &str,
        transition_id: TransitionId,
        confirmed_by: NodeId,
    ) -> Result<()> {
        let record = {
            let _guard = self.locks.lock(name).await;
            let mut record = match self.store.get(name).await? {
                Some(record) => record,
                None => {
                    tracing::debug!("Stop confirmation for {} after teardown", name);
                    return Ok(());
                }
            };

            let changed = if transition_id == record.old_transition_id() {
                record.confirm_old_stopped(transition_id)
            } else if transition_id == record.active_transition_id() {
                record.confirm_active_stopped(transition_id)
            } else {
                tracing::debug!("Stale stop confirmation {} for {}", transition_id, name);
                return Ok(());
            };

            if !changed {
                tracing::debug!("Duplicate stop confirmation {} for {}", transition_id, name);
                return Ok(());
            }
            self.store.put(record.clone()).await?;
            record
        };

        self.progress.advance(name, Stage::OldActiveStopped);
        tracing::info!("Generation {} of {} stopped", transition_id, name);

        if !self.should_drive(confirmed_by, record.primaries()) {
            return Ok(());
        }

        if record.is_marked_for_removal() {
            self.propose_teardown(name).await?;
        } else if record.compute_state() == ActiveState::NoActiveRunning {
            self.spawn_driver(TransitionDriver::start_new(&record, self.driver_context()));
        }
        Ok(())
    }

    async fn apply_start_confirmed(
        &self,
        name: &str,
        transition_id: TransitionId,
        confirmed_by: NodeId,
    ) -> Result<()> {
        let record = {
            let _guard = self.locks.lock(name).await;
            let mut record = match self.store.get(name).await? {
                Some(record) => record,
                None => {
                    tracing::debug!("Start confirmation for {} after teardown", name);
                    return Ok(());
                }
            };

            if !record.confirm_new_running(transition_id) {
                tracing::debug!("Stale or duplicate start confirmation {} for {}", transition_id, name);
                return Ok(());
            }
            self.store.put(record.clone()).await?;
            record
        };

        if self.progress.advance(name, Stage::NewActiveStarted) {
            tracing::debug!("Reconfiguration of {} reached its final stage", name);
        }
        self.progress.complete(name);
        tracing::info!(
            "Generation {} of {} running on {:?}",
            transition_id,
            name,
            record.active_set()
        );

        if record.is_marked_for_removal()
            && record.compute_state() == ActiveState::ActiveRunning
            && self.should_drive(confirmed_by, record.primaries())
        {
            self.spawn_driver(TransitionDriver::stop_current(&record, self.driver_context()));
        }
        Ok(())
    }

    async fn apply_mark_removed(
        &self,
        name: &str,
        request_id: Uuid,
        requested_by: NodeId,
    ) -> Result<()> {
        let local_request = requested_by == self.config.node_id;

        let record = {
            let _guard = self.locks.lock(name).await;
            let mut record = match self.store.get(name).await? {
                Some(record) => record,
                None => {
                    if local_request {
                        self.resolve_removal(request_id, RemoveOutcome::NotFound);
                    }
                    return Ok(());
                }
            };

            let marked = record.mark_for_removal(RemovalRequest {
                request_id,
                requested_by,
            });
            if !marked {
                tracing::debug!("Record {} already marked for removal", name);
                if local_request {
                    self.resolve_removal(request_id, RemoveOutcome::AlreadyPending);
                }
                return Ok(());
            }
            self.store.put(record.clone()).await?;
            record
        };

        tracing::info!("Record {} marked for removal by node {}", name, requested_by);

        if record.compute_state() == ActiveState::ActiveRunning
            && self.should_drive(requested_by, record.primaries())
        {
            self.spawn_driver(TransitionDriver::stop_current(&record, self.driver_context()));
        }
        Ok(())
    }

    async fn apply_teardown(&self, name: &str) -> Result<()> {
        let record = {
            let _guard = self.locks.lock(name).await;
            let record = match self.store.get(name).await? {
                Some(record) => record,
                None => {
                    tracing::debug!("Record {} already torn down", name);
                    return Ok(());
                }
            };

            if !record.is_marked_for_removal() {
                tracing::warn!("Ignoring teardown of {}: not marked for removal", name);
                return Ok(());
            }
            if record.compute_state() != ActiveState::NoActiveRunning {
                tracing::warn!(
                    "Ignoring teardown of {}: still {:?}",
                    name,
                    record.compute_state()
                );
                return Ok(());
            }

            self.store.delete(name).await?;
            record
        };
        self.locks.forget(name);
        self.progress.complete(name);

        tracing::info!("Record {} removed", name);

        if let Some(request) = record.removal_request() {
            if request.requested_by == self.config.node_id {
                self.resolve_removal(request.request_id, RemoveOutcome::Removed);
            }
        }
        Ok(())
    }

    async fn on_stop_acknowledged(&self, response: ActiveSetResponse) -> Result<()> {
        let record = match self.store.get(&response.name).await? {
            Some(record) => record,
            None => return Ok(()),
        };

        let id = response.transition_id;
        let awaited = (id == record.old_transition_id() && record.is_old_active_running())
            || (id == record.active_transition_id()
                && record.is_marked_for_removal()
                && record.is_active_running());
        if !awaited {
            tracing::debug!(
                "Stop acknowledgment for {} from node {} no longer needed",
                response.group,
                response.responder
            );
            return Ok(());
        }

        tracing::debug!("Node {} stopped {}", response.responder, response.group);
        let decision = ControlDecision::StopConfirmed {
            name: response.name.clone(),
            transition_id: id,
            confirmed_by: self.config.node_id,
        };
        self.propose(&GroupId::primary(&response.name), &decision).await?;
        Ok(())
    }

    async fn on_start_acknowledged(&self, response: ActiveSetResponse) -> Result<()> {
        let record = match self.store.get(&response.name).await? {
            Some(record) => record,
            None => return Ok(()),
        };

        let id = response.transition_id;
        if id != record.active_transition_id() || record.is_active_running() {
            tracing::debug!(
                "Start acknowledgment for {} from node {} no longer needed",
                response.group,
                response.responder
            );
            return Ok(());
        }

        tracing::debug!("Node {} started {}", response.responder, response.group);
        let decision = ControlDecision::StartConfirmed {
            name: response.name.clone(),
            transition_id: id,
            confirmed_by: self.config.node_id,
        };
        self.propose(&GroupId::primary(&response.name), &decision).await?;
        Ok(())
    }

    /// Applies a start or stop here, relays it to the rest of the set and
    /// answers the proposer once enough members have acknowledged.
    async fn relay_change(&self, direction: Direction, request: ActiveSetRequest) -> Result<()> {
        let members = self.actives.begin_relay(direction, &request).await;
        tracing::debug!(
            "Node {} relaying {} of {} ({}) to {:?}",
            self.config.node_id,
            direction,
            request.name,
            request.transition_id,
            members
        );

        for member in members {
            let message = match direction {
                Direction::Start => NetworkMessage::StartMember(request.clone()),
                Direction::Stop => NetworkMessage::StopMember(request.clone()),
            };
            if let Err(e) = self.transport.send(member, message).await {
                tracing::warn!("Failed to relay {} to node {}: {}", direction, member, e);
            }
        }

        self.answer_settled_relays().await
    }

    /// Answers the proposer of every relay whose set has settled. A lost
    /// answer is recovered by the proposer's driver retrying.
    async fn answer_settled_relays(&self) -> Result<()> {
        for (direction, proposer, response) in self.actives.take_settled(self.liveness.as_ref()) {
            let message = match direction {
                Direction::Start => NetworkMessage::ActiveSetStarted(response),
                Direction::Stop => NetworkMessage::ActiveSetStopped(response),
            };
            if let Err(e) = self.transport.send(proposer, message).await {
                tracing::warn!("Failed to answer node {} after {}: {}", proposer, direction, e);
            }
        }
        Ok(())
    }

    async fn propose_teardown(&self, name: &str) -> Result<bool> {
        let decision = ControlDecision::Teardown {
            name: name.to_string(),
            proposer: self.config.node_id,
        };
        self.propose(&GroupId::primary(name), &decision).await
    }

    async fn propose(&self, group: &GroupId, decision: &ControlDecision) -> Result<bool> {
        let payload = decision.encode()?;
        match self.consensus.propose(group, payload).await? {
            Some(_) => Ok(true),
            None => {
                tracing::debug!(
                    "Node {} could not propose {} for {}",
                    self.config.node_id,
                    decision.kind(),
                    decision.name()
                );
                Ok(false)
            }
        }
    }

    /// The proposer of a committed step drives the next one; if it is
    /// unreachable, the leader takes over.
    fn should_drive(&self, proposer: NodeId, primaries: &BTreeSet<NodeId>) -> bool {
        let local = self.config.node_id;
        if proposer == local {
            return true;
        }
        !self.liveness.is_reachable(proposer) && self.leader_for(primaries) == Some(local)
    }

    fn driver_context(&self) -> DriverContext {
        DriverContext {
            local: self.config.node_id,
            store: self.store.clone(),
            transport: self.transport.clone(),
            liveness: self.liveness.clone(),
            max_attempts: self.config.max_attempts,
        }
    }

    fn spawn_driver(&self, driver: TransitionDriver) {
        tracing::debug!(
            "Node {} driving {} of {}",
            self.config.node_id,
            driver.direction(),
            driver.transition_id()
        );
        let handle = spawn_periodic(
            driver,
            Duration::from_millis(self.config.rc_timeout_ms),
            Duration::from_millis(self.config.driver_jitter_ms),
        );

        let mut drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        drivers.retain(|handle| !handle.is_finished());
        drivers.push(handle);
    }

    fn resolve_removal(&self, request_id: Uuid, outcome: RemoveOutcome) {
        let sender = self
            .pending_removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}
