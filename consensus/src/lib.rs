mod manager;
mod messages;

pub use manager::{ConsensusHandle, ConsensusManager};
pub use messages::{CommittedDecision, GroupMembership};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Numeric node identity. Ordering matters: leader election picks the
/// lowest-numbered reachable primary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one generation of an active set. Each generation gets a
/// freshly generated id, so ids of consecutive generations never collide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct TransitionId(pub Uuid);

impl TransitionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a replicated consensus group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    /// Group replicating the reconfiguration record of `name`.
    pub fn primary(name: &str) -> Self {
        Self(format!("{}-P", name))
    }

    /// Group serving `name` for one active-set generation.
    pub fn active(name: &str, transition_id: TransitionId) -> Self {
        Self(format!("{}-{}", name, transition_id))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    /// Upper bound on time a proposal may take before it is reported lost.
    pub consensus_timeout_ms: u64,
}

/// Replicated, totally ordered decision log per group.
///
/// Every member of a group observes committed payloads in the same order.
/// `propose` returns `None` when this node cannot currently get the payload
/// ordered (not a member, group unknown, or no quorum).
#[async_trait]
pub trait Consensus: Send + Sync {
    async fn create_group(&self, group: GroupId, members: BTreeSet<NodeId>) -> Result<()>;

    async fn propose(&self, group: &GroupId, payload: Bytes) -> Result<Option<GroupId>>;
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Group {group} already exists with different members")]
    GroupMismatch { group: GroupId },

    #[error("Group {0} has no members")]
    EmptyGroup(GroupId),
}
