use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::communication::MessageHandler;
use crate::{Config, NetworkError, Result};
use consensus::NodeId;

/// In-process router connecting the nodes of a standalone cluster.
///
/// Frames to or from a partitioned node are refused, which is how tests and
/// the simulator model crashes and network splits.
pub struct NetworkManager {
    endpoints: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Bytes>>>,
    partitioned: RwLock<HashSet<NodeId>>,
}

impl NetworkManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            partitioned: RwLock::new(HashSet::new()),
        })
    }

    pub async fn register(self: &Arc<Self>, config: Config) -> MessageHandler {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.write().await.insert(config.node_id, tx);

        tracing::info!("Registered endpoint for node {}", config.node_id);
        MessageHandler::new(config, self.clone(), rx)
    }

    pub async fn partition(&self, node: NodeId) {
        tracing::warn!("Partitioning node {}", node);
        self.partitioned.write().await.insert(node);
    }

    pub async fn heal(&self, node: NodeId) {
        tracing::info!("Healing node {}", node);
        self.partitioned.write().await.remove(&node);
    }

    pub async fn is_partitioned(&self, node: NodeId) -> bool {
        self.partitioned.read().await.contains(&node)
    }

    pub(crate) async fn route(&self, from: NodeId, to: NodeId, frame: Bytes) -> Result<()> {
        {
            let partitioned = self.partitioned.read().await;
            if partitioned.contains(&from) || partitioned.contains(&to) {
                return Err(NetworkError::ConnectionFailed(format!(
                    "Node {} unreachable from {}",
                    to, from
                )));
            }
        }

        let endpoints = self.endpoints.read().await;
        let endpoint = endpoints.get(&to).ok_or(NetworkError::UnknownNode(to))?;
        endpoint.send(frame).map_err(|_| {
            NetworkError::ConnectionFailed(format!("Endpoint for node {} is closed", to))
        })
    }
}
