use bytes::Bytes;
use consensus::{NodeId, TransitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::Result;

/// Payloads agreed in a name's primary group. Every primary applies them in
/// commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlDecision {
    AddRecord {
        name: String,
        primaries: BTreeSet<NodeId>,
        actives: BTreeSet<NodeId>,
        transition_id: TransitionId,
        proposer: NodeId,
    },
    NewActives {
        name: String,
        actives: BTreeSet<NodeId>,
        transition_id: TransitionId,
        proposer: NodeId,
    },
    /// The generation `transition_id` no longer serves the name.
    StopConfirmed {
        name: String,
        transition_id: TransitionId,
        confirmed_by: NodeId,
    },
    /// The generation `transition_id` serves the name.
    StartConfirmed {
        name: String,
        transition_id: TransitionId,
        confirmed_by: NodeId,
    },
    MarkRemoved {
        name: String,
        request_id: Uuid,
        requested_by: NodeId,
    },
    Teardown {
        name: String,
        proposer: NodeId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    AddRecord,
    NewActives,
    StopConfirmed,
    StartConfirmed,
    MarkRemoved,
    Teardown,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DecisionKind::AddRecord => "add_record",
            DecisionKind::NewActives => "new_actives",
            DecisionKind::StopConfirmed => "stop_confirmed",
            DecisionKind::StartConfirmed => "start_confirmed",
            DecisionKind::MarkRemoved => "mark_removed",
            DecisionKind::Teardown => "teardown",
        };
        f.write_str(label)
    }
}

impl ControlDecision {
    pub fn name(&self) -> &str {
        match self {
            ControlDecision::AddRecord { name, .. }
            | ControlDecision::NewActives { name, .. }
            | ControlDecision::StopConfirmed { name, .. }
            | ControlDecision::StartConfirmed { name, .. }
            | ControlDecision::MarkRemoved { name, .. }
            | ControlDecision::Teardown { name, .. } => name,
        }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            ControlDecision::AddRecord { .. } => DecisionKind::AddRecord,
            ControlDecision::NewActives { .. } => DecisionKind::NewActives,
            ControlDecision::StopConfirmed { .. } => DecisionKind::StopConfirmed,
            ControlDecision::StartConfirmed { .. } => DecisionKind::StartConfirmed,
            ControlDecision::MarkRemoved { .. } => DecisionKind::MarkRemoved,
            ControlDecision::Teardown { .. } => DecisionKind::Teardown,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
