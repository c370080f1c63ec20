mod codec;
mod communication;
mod detector;
mod manager;

pub use codec::{decode_frame, encode_frame};
pub use communication::{Inbox, MessageHandler};
pub use detector::{FailureDetector, PeerHealth};
pub use manager::NetworkManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use consensus::{GroupId, NodeId, TransitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: NetworkMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkMessage {
    Ping(PingMessage),
    Pong(PongMessage),
    StartActiveSet(ActiveSetRequest),
    StopActiveSet(ActiveSetRequest),
    ActiveSetStarted(ActiveSetResponse),
    ActiveSetStopped(ActiveSetResponse),
    /// Relayed by the contacted member to the rest of the set.
    StartMember(ActiveSetRequest),
    StopMember(ActiveSetRequest),
    MemberStarted(ActiveSetResponse),
    MemberStopped(ActiveSetResponse),
    DemandReport(DemandReport),
    NameServerLoad(LoadReport),
}

impl NetworkMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::StartActiveSet(_) => "start_active_set",
            NetworkMessage::StopActiveSet(_) => "stop_active_set",
            NetworkMessage::ActiveSetStarted(_) => "active_set_started",
            NetworkMessage::ActiveSetStopped(_) => "active_set_stopped",
            NetworkMessage::StartMember(_) => "start_member",
            NetworkMessage::StopMember(_) => "stop_member",
            NetworkMessage::MemberStarted(_) => "member_started",
            NetworkMessage::MemberStopped(_) => "member_stopped",
            NetworkMessage::DemandReport(_) => "demand_report",
            NetworkMessage::NameServerLoad(_) => "name_server_load",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMessage {
    pub from: NodeId,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongMessage {
    pub from: NodeId,
    pub to: NodeId,
    /// Echo of the ping's timestamp.
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// Asks one member of a set to start or stop serving a name for the given
/// generation. The contacted member relays it to the rest of `target_set`
/// and answers `proposer` once the set has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSetRequest {
    pub request_id: Uuid,
    pub name: String,
    pub transition_id: TransitionId,
    pub proposer: NodeId,
    pub target_set: BTreeSet<NodeId>,
    pub prior_set: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSetResponse {
    pub request_id: Uuid,
    pub name: String,
    pub transition_id: TransitionId,
    /// Active group that was started or stopped.
    pub group: GroupId,
    pub responder: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandReport {
    pub name: String,
    pub reporter: NodeId,
    pub lookups: u64,
    pub updates: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    pub from: NodeId,
    pub requests_per_sec: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub node: NodeId,
    pub status: PeerStatus,
    pub at: DateTime<Utc>,
}

/// Point-to-point, fire-and-forget delivery. Replies arrive as separate
/// inbound messages.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> NodeId;

    async fn send(&self, to: NodeId, message: NetworkMessage) -> Result<()>;
}

/// Failure-detector view consumed by the reconfiguration logic.
pub trait Liveness: Send + Sync {
    fn is_reachable(&self, node: NodeId) -> bool;

    /// Latest round-trip estimate, if any.
    fn latency(&self, node: NodeId) -> Option<Duration>;

    fn subscribe(&self) -> broadcast::Receiver<FailureEvent>;
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,
    pub heartbeat_interval_ms: u64,
    /// A peer silent for this long is reported down.
    pub failure_timeout_ms: u64,
}
