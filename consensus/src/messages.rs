use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{GroupId, NodeId};

/// A payload that has been ordered within its group, as delivered to each
/// live member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedDecision {
    pub group: GroupId,
    pub slot: u64,
    pub proposer: NodeId,
    pub payload: Bytes,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: GroupId,
    pub members: BTreeSet<NodeId>,
    pub next_slot: u64,
    pub created_at: DateTime<Utc>,
}

impl GroupMembership {
    pub fn new(group: GroupId, members: BTreeSet<NodeId>) -> Self {
        Self {
            group,
            members,
            next_slot: 0,
            created_at: Utc::now(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}
