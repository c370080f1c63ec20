use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};

use crate::{
    Config, FailureEvent, Liveness, NetworkMessage, PeerStatus, PingMessage, PongMessage,
    Transport,
};
use consensus::NodeId;

#[derive(Debug, Clone, Copy)]
pub struct PeerHealth {
    pub status: PeerStatus,
    pub last_seen: Instant,
    pub round_trip: Option<Duration>,
}

/// Heartbeat failure detector. Every peer starts out up; one silent for
/// `failure_timeout_ms` is reported down until it is heard from again.
pub struct FailureDetector {
    config: Config,
    peers: RwLock<HashMap<NodeId, PeerHealth>>,
    events: broadcast::Sender<FailureEvent>,
    sequence: AtomicU64,
}

impl FailureDetector {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        let peers = config
            .peers
            .iter()
            .filter(|peer| **peer != config.node_id)
            .map(|peer| {
                (
                    *peer,
                    PeerHealth {
                        status: PeerStatus::Up,
                        last_seen: now,
                        round_trip: None,
                    },
                )
            })
            .collect();
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            peers: RwLock::new(peers),
            events,
            sequence: AtomicU64::new(0),
        }
    }

    /// Sends heartbeats and sweeps for silent peers until the task is dropped.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn Transport>) {
        tracing::info!("Starting failure detector for node {}", self.config.node_id);

        let mut ticker = interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        loop {
            ticker.tick().await;

            let ping = PingMessage {
                from: self.config.node_id,
                timestamp: Utc::now(),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            };
            for peer in self.peer_ids() {
                if let Err(e) = transport.send(peer, NetworkMessage::Ping(ping.clone())).await {
                    tracing::trace!("Heartbeat to {} failed: {}", peer, e);
                }
            }

            self.sweep();
        }
    }

    pub async fn handle_ping(&self, transport: &dyn Transport, ping: PingMessage) {
        self.observe(ping.from, None);

        let pong = PongMessage {
            from: self.config.node_id,
            to: ping.from,
            timestamp: ping.timestamp,
            sequence: ping.sequence,
        };
        if let Err(e) = transport.send(ping.from, NetworkMessage::Pong(pong)).await {
            tracing::trace!("Heartbeat reply to {} failed: {}", ping.from, e);
        }
    }

    pub fn handle_pong(&self, pong: PongMessage) {
        let round_trip = Utc::now()
            .signed_duration_since(pong.timestamp)
            .to_std()
            .ok();
        self.observe(pong.from, round_trip);
    }

    /// Records evidence that `node` is alive.
    pub fn observe(&self, node: NodeId, round_trip: Option<Duration>) {
        let came_back = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let health = match peers.get_mut(&node) {
                Some(health) => health,
                None => return,
            };
            health.last_seen = Instant::now();
            if round_trip.is_some() {
                health.round_trip = round_trip;
            }
            let came_back = health.status == PeerStatus::Down;
            health.status = PeerStatus::Up;
            came_back
        };

        if came_back {
            tracing::info!("Node {} is reachable again", node);
            self.publish(node, PeerStatus::Up);
        }
    }

    /// Reports every peer silent past the timeout as down.
    pub fn sweep(&self) {
        let timeout = Duration::from_millis(self.config.failure_timeout_ms);
        let now = Instant::now();

        let failed: Vec<NodeId> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers
                .iter_mut()
                .filter(|(_, health)| {
                    health.status == PeerStatus::Up && now.duration_since(health.last_seen) > timeout
                })
                .map(|(node, health)| {
                    health.status = PeerStatus::Down;
                    *node
                })
                .collect()
        };

        for node in failed {
            tracing::warn!("Node {} marked as failed due to missed heartbeats", node);
            self.publish(node, PeerStatus::Down);
        }
    }

    pub fn mark_down(&self, node: NodeId) {
        let changed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            match peers.get_mut(&node) {
                Some(health) if health.status == PeerStatus::Up => {
                    health.status = PeerStatus::Down;
                    true
                }
                _ => false,
            }
        };

        if changed {
            tracing::warn!("Node {} marked as failed", node);
            self.publish(node, PeerStatus::Down);
        }
    }

    pub fn health(&self) -> Vec<(NodeId, PeerHealth)> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut health: Vec<(NodeId, PeerHealth)> =
            peers.iter().map(|(node, health)| (*node, *health)).collect();
        health.sort_by_key(|(node, _)| *node);
        health
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.keys().copied().collect()
    }

    fn publish(&self, node: NodeId, status: PeerStatus) {
        // No subscribers is fine.
        let _ = self.events.send(FailureEvent {
            node,
            status,
            at: Utc::now(),
        });
    }
}

impl Liveness for FailureDetector {
    fn is_reachable(&self, node: NodeId) -> bool {
        if node == self.config.node_id {
            return true;
        }
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        matches!(peers.get(&node), Some(health) if health.status == PeerStatus::Up)
    }

    fn latency(&self, node: NodeId) -> Option<Duration> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(&node).and_then(|health| health.round_trip)
    }

    fn subscribe(&self) -> broadcast::Receiver<FailureEvent> {
        self.events.subscribe()
    }
}
