use consensus::{ConsensusManager, NodeId};
use controller::ReconfigurationCoordinator;
use network::NetworkManager;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use storage::{RecordState, RecordStore};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{GnsError, Result};
use crate::node::Node;

/// A standalone deployment: every node runs in this process, sharing one
/// consensus engine and one message router.
pub struct LocalCluster {
    config: Config,
    consensus: Arc<ConsensusManager>,
    network: Arc<NetworkManager>,
    nodes: BTreeMap<NodeId, Arc<Node>>,
    crashed: Mutex<BTreeSet<NodeId>>,
}

impl LocalCluster {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let consensus = ConsensusManager::new();
        let network = NetworkManager::new();

        let mut nodes = BTreeMap::new();
        for node_id in config.node_ids() {
            let node = Node::new(&config, node_id, &consensus, &network).await?;
            nodes.insert(node_id, Arc::new(node));
        }

        info!("Built local cluster of {} nodes", nodes.len());
        Ok(Self {
            config,
            consensus,
            network,
            nodes,
            crashed: Mutex::new(BTreeSet::new()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        for node in self.nodes.values() {
            node.start().await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(&node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    /// Coordinators of the nodes that have not crashed.
    pub fn coordinators(&self) -> BTreeMap<NodeId, Arc<ReconfigurationCoordinator>> {
        let crashed = self.crashed.lock().unwrap_or_else(|e| e.into_inner());
        self.nodes
            .iter()
            .filter(|(node_id, _)| !crashed.contains(node_id))
            .map(|(node_id, node)| (*node_id, node.coordinator().clone()))
            .collect()
    }

    pub fn coordinator(&self, node_id: NodeId) -> Result<&Arc<ReconfigurationCoordinator>> {
        self.nodes
            .get(&node_id)
            .map(|node| node.coordinator())
            .ok_or_else(|| GnsError::Node(format!("Unknown node {}", node_id)))
    }

    /// Crash-stops `node_id`: its services stop, it leaves every consensus
    /// group and the router drops its traffic. Survivors notice through
    /// missed heartbeats.
    pub async fn crash(&self, node_id: NodeId) -> Result<()> {
        let node = self
            .nodes
            .get(&node_id)
            .ok_or_else(|| GnsError::Node(format!("Unknown node {}", node_id)))?;

        warn!("Crashing node {}", node_id);
        node.stop().await?;
        self.consensus.crash(node_id).await;
        self.network.partition(node_id).await;
        self.crashed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id);
        Ok(())
    }

    pub fn is_crashed(&self, node_id: NodeId) -> bool {
        self.crashed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&node_id)
    }

    /// Cuts `node_id` off the network while it keeps running.
    pub async fn partition(&self, node_id: NodeId) {
        self.network.partition(node_id).await;
    }

    pub async fn heal(&self, node_id: NodeId) {
        self.network.heal(node_id).await;
    }

    /// `name` as stored on `node_id`.
    pub async fn record_on(&self, node_id: NodeId, name: &str) -> Result<Option<RecordState>> {
        let node = self
            .nodes
            .get(&node_id)
            .ok_or_else(|| GnsError::Node(format!("Unknown node {}", node_id)))?;
        Ok(node.store().get(name).await?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down local cluster");
        for (node_id, node) in &self.nodes {
            if !self.is_crashed(*node_id) {
                node.stop().await?;
            }
        }
        Ok(())
    }
}
