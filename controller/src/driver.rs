//! Retrying start/stop of one active-set generation.
//!
//! A [`TransitionDriver`] contacts one untried candidate per tick until the
//! record shows the awaited state, the generation is superseded, or the
//! attempt budget runs out. All of its decisions are re-derived from the
//! stored record on every tick.

use async_trait::async_trait;
use consensus::{NodeId, TransitionId};
use network::{ActiveSetRequest, Liveness, NetworkMessage, Transport};
use rand::Rng;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use storage::{RecordState, RecordStore};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stop,
    Start,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Stop => f.write_str("stop"),
            Direction::Start => f.write_str("start"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The record shows the awaited state.
    Completed,
    /// The record moved on to a different generation.
    Superseded,
    RecordMissing,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Continue,
    Finished(DriverOutcome),
}

/// Work that is polled on a fixed cadence until it reports completion.
#[async_trait]
pub trait PeriodicTask: Send {
    fn label(&self) -> String;

    async fn poll_once(&mut self) -> Poll;
}

/// Polls `task` immediately, then every `period` plus up to `jitter`.
pub async fn run_periodic<T: PeriodicTask>(
    mut task: T,
    period: Duration,
    jitter: Duration,
) -> DriverOutcome {
    loop {
        match task.poll_once().await {
            Poll::Finished(outcome) => {
                tracing::debug!("{} finished: {:?}", task.label(), outcome);
                return outcome;
            }
            Poll::Continue => {
                let extra = if jitter.is_zero() {
                    Duration::ZERO
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..=jitter)
                };
                tokio::time::sleep(period + extra).await;
            }
        }
    }
}

pub fn spawn_periodic<T: PeriodicTask + 'static>(
    task: T,
    period: Duration,
    jitter: Duration,
) -> JoinHandle<DriverOutcome> {
    tokio::spawn(run_periodic(task, period, jitter))
}

/// Collaborators shared by every driver a node runs.
#[derive(Clone)]
pub struct DriverContext {
    pub local: NodeId,
    pub store: Arc<dyn RecordStore>,
    pub transport: Arc<dyn Transport>,
    pub liveness: Arc<dyn Liveness>,
    pub max_attempts: u32,
}

enum Check {
    Pending,
    Satisfied,
    Superseded,
}

pub struct TransitionDriver {
    direction: Direction,
    name: String,
    transition_id: TransitionId,
    target_set: BTreeSet<NodeId>,
    prior_set: BTreeSet<NodeId>,
    queried: HashSet<NodeId>,
    attempts: u32,
    context: DriverContext,
}

impl TransitionDriver {
    /// Stops the previous generation of `record`.
    pub fn stop_old(record: &RecordState, context: DriverContext) -> Self {
        Self::new(
            Direction::Stop,
            record.name(),
            record.old_transition_id(),
            record.old_active_set().clone(),
            record.active_set().clone(),
            context,
        )
    }

    /// Stops the current generation of a record on its way to removal.
    pub fn stop_current(record: &RecordState, context: DriverContext) -> Self {
        Self::new(
            Direction::Stop,
            record.name(),
            record.active_transition_id(),
            record.active_set().clone(),
            BTreeSet::new(),
            context,
        )
    }

    /// Starts the current generation of `record`.
    pub fn start_new(record: &RecordState, context: DriverContext) -> Self {
        Self::new(
            Direction::Start,
            record.name(),
            record.active_transition_id(),
            record.active_set().clone(),
            record.old_active_set().clone(),
            context,
        )
    }

    pub fn new(
        direction: Direction,
        name: &str,
        transition_id: TransitionId,
        target_set: BTreeSet<NodeId>,
        prior_set: BTreeSet<NodeId>,
        context: DriverContext,
    ) -> Self {
        Self {
            direction,
            name: name.to_string(),
            transition_id,
            target_set,
            prior_set,
            queried: HashSet::new(),
            attempts: 0,
            context,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transition_id(&self) -> TransitionId {
        self.transition_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn queried(&self) -> &HashSet<NodeId> {
        &self.queried
    }

    fn check(&self, record: &RecordState) -> Check {
        let id = self.transition_id;
        let satisfied = match self.direction {
            Direction::Stop if id == record.old_transition_id() => !record.is_old_active_running(),
            Direction::Stop if id == record.active_transition_id() && record.is_marked_for_removal() => {
                !record.is_active_running()
            }
            Direction::Start if id == record.active_transition_id() => record.is_active_running(),
            _ => return Check::Superseded,
        };

        if satisfied {
            Check::Satisfied
        } else {
            Check::Pending
        }
    }

    /// Fastest untried reachable candidate; candidates without a latency
    /// estimate come last, in node order.
    fn next_candidate(&self) -> Option<NodeId> {
        let liveness = &self.context.liveness;
        self.target_set
            .iter()
            .filter(|node| !self.queried.contains(*node) && liveness.is_reachable(**node))
            .min_by_key(|node| (liveness.latency(**node).unwrap_or(Duration::MAX), **node))
            .copied()
    }

    fn request(&self) -> ActiveSetRequest {
        ActiveSetRequest {
            request_id: Uuid::new_v4(),
            name: self.name.clone(),
            transition_id: self.transition_id,
            proposer: self.context.local,
            target_set: self.target_set.clone(),
            prior_set: self.prior_set.clone(),
        }
    }
}

#[async_trait]
impl PeriodicTask for TransitionDriver {
    fn label(&self) -> String {
        format!("{} driver for {} ({})", self.direction, self.name, self.transition_id)
    }

    async fn poll_once(&mut self) -> Poll {
        let record = match self.context.store.get(&self.name).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("{}: failed to read record: {}", self.label(), e);
                self.attempts += 1;
                return Poll::Continue;
            }
        };

        let record = match record {
            Some(record) => record,
            None => {
                tracing::warn!("{}: record no longer exists, cancelling", self.label());
                return Poll::Finished(DriverOutcome::RecordMissing);
            }
        };

        match self.check(&record) {
            Check::Superseded => {
                tracing::debug!("{}: superseded by a newer generation", self.label());
                return Poll::Finished(DriverOutcome::Superseded);
            }
            Check::Satisfied => {
                tracing::debug!("{}: confirmed after {} attempts", self.label(), self.attempts);
                return Poll::Finished(DriverOutcome::Completed);
            }
            Check::Pending => {}
        }

        if self.attempts >= self.context.max_attempts {
            tracing::error!(
                "{}: giving up after {} attempts, queried {:?}",
                self.label(),
                self.attempts,
                self.queried
            );
            return Poll::Finished(DriverOutcome::Exhausted);
        }
        self.attempts += 1;

        let candidate = match self.next_candidate() {
            Some(candidate) => candidate,
            None => {
                tracing::warn!(
                    "{}: no untried reachable member of {:?}",
                    self.label(),
                    self.target_set
                );
                return Poll::Continue;
            }
        };
        self.queried.insert(candidate);

        let request = self.request();
        let message = match self.direction {
            Direction::Stop => NetworkMessage::StopActiveSet(request),
            Direction::Start => NetworkMessage::StartActiveSet(request),
        };

        tracing::debug!("{}: contacting node {} (attempt {})", self.label(), candidate, self.attempts);
        if let Err(e) = self.context.transport.send(candidate, message).await {
            tracing::warn!("{}: request to node {} failed: {}", self.label(), candidate, e);
        }

        Poll::Continue
    }
}
