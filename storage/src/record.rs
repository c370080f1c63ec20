use chrono::{DateTime, Utc};
use consensus::{NodeId, TransitionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::demand::DemandStats;
use crate::{Result, StorageError};

/// Which of the two tracked active sets is currently serving the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveState {
    /// Current set serving, previous set stopped. Steady state.
    ActiveRunning,
    /// Transition begun, previous set not yet confirmed stopped.
    OldActiveRunning,
    /// Previous set stopped, new set not yet confirmed started.
    NoActiveRunning,
    /// Both sets flagged running. Must never happen.
    Conflict,
}

/// Client request that put a record on the removal path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRequest {
    pub request_id: Uuid,
    pub requested_by: NodeId,
}

/// Reconfiguration state of one name, replicated at each of its primaries.
///
/// The transition fields only change through [`begin_transition`],
/// [`confirm_old_stopped`], [`confirm_new_running`] and
/// [`confirm_active_stopped`]; each confirmation is idempotent and ignores
/// ids that do not match the stored generation.
///
/// [`begin_transition`]: RecordState::begin_transition
/// [`confirm_old_stopped`]: RecordState::confirm_old_stopped
/// [`confirm_new_running`]: RecordState::confirm_new_running
/// [`confirm_active_stopped`]: RecordState::confirm_active_stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordState {
    name: String,
    primaries: BTreeSet<NodeId>,
    active_set: BTreeSet<NodeId>,
    old_active_set: BTreeSet<NodeId>,
    active_running: bool,
    old_active_running: bool,
    active_transition_id: TransitionId,
    old_transition_id: TransitionId,
    marked_for_removal: bool,
    removal_request: Option<RemovalRequest>,
    votes: BTreeMap<NodeId, u64>,
    pub demand: DemandStats,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl RecordState {
    /// New record whose initial active set has not been started yet. The
    /// old slot holds an empty, stopped generation.
    pub fn new(
        name: impl Into<String>,
        primaries: BTreeSet<NodeId>,
        actives: BTreeSet<NodeId>,
        transition_id: TransitionId,
        moving_average_window: usize,
    ) -> Self {
        let mut old_transition_id = TransitionId::generate();
        while old_transition_id == transition_id {
            old_transition_id = TransitionId::generate();
        }

        Self {
            name: name.into(),
            primaries,
            active_set: actives,
            old_active_set: BTreeSet::new(),
            active_running: false,
            old_active_running: false,
            active_transition_id: transition_id,
            old_transition_id,
            marked_for_removal: false,
            removal_request: None,
            votes: BTreeMap::new(),
            demand: DemandStats::new(moving_average_window),
            created_at: Utc::now(),
            last_transition_at: None,
        }
    }

    /// Record already serving `actives`, as restored after a restart or
    /// seeded by tests.
    pub fn running(
        name: impl Into<String>,
        primaries: BTreeSet<NodeId>,
        actives: BTreeSet<NodeId>,
        transition_id: TransitionId,
        moving_average_window: usize,
    ) -> Self {
        let mut record = Self::new(name, primaries, actives, transition_id, moving_average_window);
        record.active_running = true;
        record
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primaries(&self) -> &BTreeSet<NodeId> {
        &self.primaries
    }

    pub fn active_set(&self) -> &BTreeSet<NodeId> {
        &self.active_set
    }

    pub fn old_active_set(&self) -> &BTreeSet<NodeId> {
        &self.old_active_set
    }

    pub fn is_active_running(&self) -> bool {
        self.active_running
    }

    pub fn is_old_active_running(&self) -> bool {
        self.old_active_running
    }

    pub fn active_transition_id(&self) -> TransitionId {
        self.active_transition_id
    }

    pub fn old_transition_id(&self) -> TransitionId {
        self.old_transition_id
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    pub fn removal_request(&self) -> Option<&RemovalRequest> {
        self.removal_request.as_ref()
    }

    pub fn votes(&self) -> &BTreeMap<NodeId, u64> {
        &self.votes
    }

    pub fn is_primary(&self, node: NodeId) -> bool {
        self.primaries.contains(&node)
    }

    pub fn compute_state(&self) -> ActiveState {
        match (self.active_running, self.old_active_running) {
            (true, false) => ActiveState::ActiveRunning,
            (false, true) => ActiveState::OldActiveRunning,
            (false, false) => ActiveState::NoActiveRunning,
            (true, true) => {
                tracing::error!(
                    "CONFLICT: record {} has both active set {:?} ({}) and old set {:?} ({}) running",
                    self.name,
                    self.active_set,
                    self.active_transition_id,
                    self.old_active_set,
                    self.old_transition_id
                );
                ActiveState::Conflict
            }
        }
    }

    /// Moves the current generation into the old slot and installs
    /// `new_set` as a not-yet-running generation.
    ///
    /// Only allowed from `ActiveRunning`, and only with an id distinct from
    /// both stored ids.
    pub fn begin_transition(
        &mut self,
        new_set: BTreeSet<NodeId>,
        new_id: TransitionId,
    ) -> Result<()> {
        if new_id == self.active_transition_id || new_id == self.old_transition_id {
            return Err(StorageError::DuplicateTransition {
                name: self.name.clone(),
                transition_id: new_id,
            });
        }

        let state = self.compute_state();
        if state != ActiveState::ActiveRunning {
            return Err(StorageError::TransitionInProgress {
                name: self.name.clone(),
                state,
            });
        }

        self.old_active_set = std::mem::replace(&mut self.active_set, new_set);
        self.old_active_running = self.active_running;
        self.old_transition_id = self.active_transition_id;
        self.active_running = false;
        self.active_transition_id = new_id;
        self.last_transition_at = Some(Utc::now());

        Ok(())
    }

    /// Returns true if the call changed the record.
    pub fn confirm_old_stopped(&mut self, transition_id: TransitionId) -> bool {
        if transition_id != self.old_transition_id || !self.old_active_running {
            return false;
        }
        self.old_active_running = false;
        true
    }

    /// Returns true if the call changed the record.
    pub fn confirm_new_running(&mut self, transition_id: TransitionId) -> bool {
        if transition_id != self.active_transition_id || self.active_running {
            return false;
        }
        self.active_running = true;
        true
    }

    /// Removal path: the current generation has been stopped. Only honored
    /// for records marked for removal.
    pub fn confirm_active_stopped(&mut self, transition_id: TransitionId) -> bool {
        if !self.marked_for_removal
            || transition_id != self.active_transition_id
            || !self.active_running
        {
            return false;
        }
        self.active_running = false;
        true
    }

    /// Returns false if the record was already marked.
    pub fn mark_for_removal(&mut self, request: RemovalRequest) -> bool {
        if self.marked_for_removal {
            return false;
        }
        self.marked_for_removal = true;
        self.removal_request = Some(request);
        true
    }

    /// Counts a lookup-path report from `voter`: lookups vote for the
    /// reporting node as a good location for the name.
    pub fn record_demand(&mut self, voter: NodeId, lookups: u64, updates: u64) {
        self.demand.record(voter, lookups, updates);
        if lookups > 0 {
            let votes = self.votes.entry(voter).or_insert(0);
            *votes = votes.saturating_add(lookups);
        }
    }

    /// Nodes ordered by vote count, highest first, ties by node id.
    pub fn ranked_voters(&self) -> Vec<NodeId> {
        let mut ranked: Vec<(NodeId, u64)> =
            self.votes.iter().map(|(node, votes)| (*node, *votes)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(node, _)| node).collect()
    }
}
