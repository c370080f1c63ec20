use thiserror::Error;

#[derive(Error, Debug)]
pub enum GnsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Controller error: {0}")]
    Controller(#[from] controller::ControllerError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Node error: {0}")]
    Node(String),
}

pub type Result<T> = std::result::Result<T, GnsError>;
