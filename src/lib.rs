pub mod cluster;
pub mod config;
pub mod error;
pub mod node;

pub use cluster::LocalCluster;
pub use config::{Config, ControllerSettings};
pub use error::{GnsError, Result};
pub use node::Node;

// Re-export key types from workspace crates
pub use api;
pub use consensus;
pub use controller;
pub use network;
pub use storage;
