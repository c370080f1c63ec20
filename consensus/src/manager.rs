use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::messages::{CommittedDecision, GroupMembership};
use crate::{Config, Consensus, ConsensusError, GroupId, NodeId, Result};

/// In-process group engine shared by every node of a standalone cluster.
///
/// Proposals to one group are sequenced under a single lock and delivered to
/// each live member's channel before the lock is released, so all members see
/// the same order. A proposal succeeds only while a majority of the group is
/// live.
pub struct ConsensusManager {
    groups: Mutex<HashMap<GroupId, GroupMembership>>,
    subscribers: RwLock<HashMap<NodeId, mpsc::UnboundedSender<CommittedDecision>>>,
    crashed: RwLock<HashSet<NodeId>>,
}

impl ConsensusManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            crashed: RwLock::new(HashSet::new()),
        })
    }

    /// Attaches a node and returns its handle plus the stream of decisions
    /// committed in groups it belongs to.
    pub async fn register(
        self: &Arc<Self>,
        config: Config,
    ) -> (ConsensusHandle, mpsc::UnboundedReceiver<CommittedDecision>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.insert(config.node_id, tx);
        self.crashed.write().await.remove(&config.node_id);

        tracing::info!("Registered node {} with consensus engine", config.node_id);

        (
            ConsensusHandle {
                config,
                manager: self.clone(),
            },
            rx,
        )
    }

    /// Stops delivering to and accepting proposals from `node`.
    pub async fn crash(&self, node: NodeId) {
        tracing::warn!("Node {} removed from consensus", node);
        self.crashed.write().await.insert(node);
    }

    pub async fn is_live(&self, node: NodeId) -> bool {
        !self.crashed.read().await.contains(&node)
    }

    pub async fn membership(&self, group: &GroupId) -> Option<GroupMembership> {
        self.groups.lock().await.get(group).cloned()
    }

    async fn create_group(&self, group: GroupId, members: BTreeSet<NodeId>) -> Result<()> {
        if members.is_empty() {
            return Err(ConsensusError::EmptyGroup(group));
        }

        let mut groups = self.groups.lock().await;
        if let Some(existing) = groups.get(&group) {
            if existing.members == members {
                tracing::debug!("Group {} already exists", group);
                return Ok(());
            }
            return Err(ConsensusError::GroupMismatch { group });
        }

        tracing::info!("Created group {} with members {:?}", group, members);
        groups.insert(group.clone(), GroupMembership::new(group, members));
        Ok(())
    }

    async fn propose(
        &self,
        proposer: NodeId,
        group: &GroupId,
        payload: Bytes,
    ) -> Result<Option<GroupId>> {
        let mut groups = self.groups.lock().await;

        let membership = match groups.get_mut(group) {
            Some(membership) => membership,
            None => {
                tracing::debug!("Proposal from {} to unknown group {}", proposer, group);
                return Ok(None);
            }
        };

        let crashed = self.crashed.read().await;
        if crashed.contains(&proposer) || !membership.members.contains(&proposer) {
            tracing::debug!("Node {} cannot propose to group {}", proposer, group);
            return Ok(None);
        }

        let live: Vec<NodeId> = membership
            .members
            .iter()
            .filter(|member| !crashed.contains(member))
            .copied()
            .collect();

        if live.len() < membership.quorum() {
            tracing::warn!(
                "No quorum for group {}: {} of {} members live",
                group,
                live.len(),
                membership.members.len()
            );
            return Ok(None);
        }

        let slot = membership.next_slot;
        membership.next_slot += 1;

        let decision = CommittedDecision {
            group: group.clone(),
            slot,
            proposer,
            payload,
            committed_at: Utc::now(),
        };

        let subscribers = self.subscribers.read().await;
        for member in live {
            if let Some(sender) = subscribers.get(&member) {
                if sender.send(decision.clone()).is_err() {
                    tracing::debug!("Node {} no longer receives decisions", member);
                }
            }
        }

        tracing::trace!("Committed slot {} in group {}", slot, group);
        Ok(Some(group.clone()))
    }
}

/// Per-node view of the shared engine.
#[derive(Clone)]
pub struct ConsensusHandle {
    config: Config,
    manager: Arc<ConsensusManager>,
}

impl ConsensusHandle {
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }
}

#[async_trait]
impl Consensus for ConsensusHandle {
    async fn create_group(&self, group: GroupId, members: BTreeSet<NodeId>) -> Result<()> {
        self.manager.create_group(group, members).await
    }

    async fn propose(&self, group: &GroupId, payload: Bytes) -> Result<Option<GroupId>> {
        let timeout = tokio::time::Duration::from_millis(self.config.consensus_timeout_ms);
        tokio::time::timeout(
            timeout,
            self.manager.propose(self.config.node_id, group, payload),
        )
        .await
        .map_err(|_| ConsensusError::Network(format!("Proposal to {} timed out", group)))?
    }
}
