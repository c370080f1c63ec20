mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use server::Server;

use chrono::{DateTime, Utc};
use consensus::{NodeId, TransitionId};
use controller::RemoveOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use storage::{ActiveState, RecordState, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_ip: IpAddr,
    pub port: u16,
    /// How long a remove request waits for its acknowledgment.
    pub remove_timeout_ms: u64,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.node_ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandRequest {
    pub reporter: NodeId,
    #[serde(default)]
    pub lookups: u64,
    #[serde(default)]
    pub updates: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordView {
    pub name: String,
    pub primaries: Vec<NodeId>,
    pub active_set: Vec<NodeId>,
    pub old_active_set: Vec<NodeId>,
    pub active_running: bool,
    pub old_active_running: bool,
    pub active_transition_id: TransitionId,
    pub old_transition_id: TransitionId,
    pub state: ActiveState,
    pub marked_for_removal: bool,
    pub lookup_rate: f64,
    pub update_rate: f64,
    pub stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl RecordView {
    pub fn from_record(record: &RecordState, stage: Option<Stage>) -> Self {
        let (lookup_rate, update_rate) = record.demand.rates();
        Self {
            name: record.name().to_string(),
            primaries: record.primaries().iter().copied().collect(),
            active_set: record.active_set().iter().copied().collect(),
            old_active_set: record.old_active_set().iter().copied().collect(),
            active_running: record.is_active_running(),
            old_active_running: record.is_old_active_running(),
            active_transition_id: record.active_transition_id(),
            old_transition_id: record.old_transition_id(),
            state: record.compute_state(),
            marked_for_removal: record.is_marked_for_removal(),
            lookup_rate,
            update_rate,
            stage,
            created_at: record.created_at,
            last_transition_at: record.last_transition_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivesResponse {
    pub name: String,
    pub actives: BTreeSet<NodeId>,
    pub transition_id: TransitionId,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub name: String,
    pub outcome: RemoveOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: NodeId,
    pub nodes: usize,
    pub reachable: usize,
    pub timestamp: DateTime<Utc>,
}
