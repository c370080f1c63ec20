use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::codec::{decode_frame, encode_frame};
use crate::manager::NetworkManager;
use crate::{Config, Envelope, NetworkError, NetworkMessage, Result, Transport};
use consensus::NodeId;

/// One node's endpoint on the router.
pub struct MessageHandler {
    config: Config,
    manager: Arc<NetworkManager>,
    message_receiver: Arc<RwLock<Option<mpsc::UnboundedReceiver<Bytes>>>>,
}

impl MessageHandler {
    pub(crate) fn new(
        config: Config,
        manager: Arc<NetworkManager>,
        receiver: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            config,
            manager,
            message_receiver: Arc::new(RwLock::new(Some(receiver))),
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.config.peers
    }

    /// Hands out the inbound stream. Can be taken once.
    pub async fn take_inbox(&self) -> Result<Inbox> {
        let mut guard = self.message_receiver.write().await;
        let receiver = guard.take().ok_or_else(|| {
            NetworkError::Protocol("Message receiver already taken".to_string())
        })?;
        Ok(Inbox {
            node_id: self.config.node_id,
            receiver,
        })
    }

    pub async fn broadcast_message(&self, message: NetworkMessage) -> Result<()> {
        let mut failed_nodes = Vec::new();

        for peer in &self.config.peers {
            if *peer == self.config.node_id {
                continue;
            }
            if self.send(*peer, message.clone()).await.is_err() {
                failed_nodes.push(*peer);
            }
        }

        if !failed_nodes.is_empty() {
            tracing::trace!(
                "Failed to broadcast {} to {} nodes: {:?}",
                message.kind(),
                failed_nodes.len(),
                failed_nodes
            );
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for MessageHandler {
    fn local_id(&self) -> NodeId {
        self.config.node_id
    }

    async fn send(&self, to: NodeId, message: NetworkMessage) -> Result<()> {
        let envelope = Envelope {
            from: self.config.node_id,
            to,
            message,
        };
        let frame = encode_frame(&envelope)?;
        self.manager.route(self.config.node_id, to, frame).await
    }
}

/// Decoded inbound stream of one node.
pub struct Inbox {
    node_id: NodeId,
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl Inbox {
    /// Next well-formed envelope. Malformed frames are logged and dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.receiver.recv().await?;
            match decode_frame(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    tracing::error!("Node {} dropped malformed frame: {}", self.node_id, e);
                }
            }
        }
    }
}
