pub mod active;
pub mod coordinator;
pub mod decision;
pub mod driver;
pub mod election;
pub mod placement;
pub mod scheduler;

pub use active::{ActiveGeneration, ActiveReplicas};
pub use coordinator::{AddOutcome, ReconfigurationCoordinator, RemoveOutcome};
pub use decision::{ControlDecision, DecisionKind};
pub use driver::{
    run_periodic, spawn_periodic, Direction, DriverContext, DriverOutcome, PeriodicTask, Poll,
    TransitionDriver,
};
pub use election::{elect_leader, is_leader};
pub use placement::{
    desired_replica_count, initial_actives, policy_for, primaries_for, LoadBalancedPlacement,
    LocalityPlacement, PlacementContext, PlacementPolicy, RandomPlacement, ReplicaParams,
};
pub use scheduler::{ReconfigurationScheduler, RoundSummary};

use consensus::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    Random,
    Locality,
    LoadBalanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    /// Every node of the deployment, including this one.
    pub nodes: Vec<NodeId>,
    pub num_primaries: usize,
    pub min_replica: usize,
    pub max_replica: usize,
    pub normalizing_constant: f64,
    pub analysis_interval_ms: u64,
    pub analysis_initial_delay_ms: u64,
    /// Pause between successive proposals within one round.
    pub group_change_pause_ms: u64,
    /// Tick interval of start/stop drivers.
    pub rc_timeout_ms: u64,
    pub driver_jitter_ms: u64,
    pub max_attempts: u32,
    pub moving_average_window: usize,
    pub placement: PlacementStrategy,
    /// Skip proposals whose new active set equals the current one.
    pub skip_unchanged_actives: bool,
}

impl Config {
    pub fn new(node_id: NodeId, nodes: Vec<NodeId>) -> Self {
        Self {
            node_id,
            nodes,
            num_primaries: 3,
            min_replica: 3,
            max_replica: 100,
            normalizing_constant: 0.5,
            analysis_interval_ms: 60_000,
            analysis_initial_delay_ms: 60_000,
            group_change_pause_ms: 100,
            rc_timeout_ms: 3_000,
            driver_jitter_ms: 0,
            max_attempts: 10,
            moving_average_window: 20,
            placement: PlacementStrategy::Locality,
            skip_unchanged_actives: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains(&self.node_id) {
            return Err(ControllerError::InvalidConfig(format!(
                "Node {} is not part of the node list",
                self.node_id
            )));
        }
        if self.min_replica == 0 || self.min_replica > self.max_replica {
            return Err(ControllerError::InvalidConfig(format!(
                "Replica bounds [{}, {}] are invalid",
                self.min_replica, self.max_replica
            )));
        }
        if self.normalizing_constant <= 0.0 {
            return Err(ControllerError::InvalidConfig(
                "Normalizing constant must be positive".to_string(),
            ));
        }
        if self.num_primaries == 0 || self.max_attempts == 0 {
            return Err(ControllerError::InvalidConfig(
                "Primary count and driver attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn replica_params(&self) -> ReplicaParams {
        ReplicaParams {
            min_replica: self.min_replica,
            max_replica: self.max_replica,
            total_nodes: self.nodes.len(),
            normalizing_constant: self.normalizing_constant,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Malformed decision: {0}")]
    MalformedDecision(#[from] serde_json::Error),

    #[error("Node {node} is not a primary of {name}")]
    NotPrimary { name: String, node: NodeId },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
