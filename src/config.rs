use consensus::NodeId;
use controller::PlacementStrategy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::error::{GnsError, Result};

/// Knobs of the reconfiguration subsystem, shared by every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub num_primaries: usize,
    pub min_replica: usize,
    pub max_replica: usize,
    pub normalizing_constant: f64,
    pub analysis_interval_ms: u64,
    pub analysis_initial_delay_ms: u64,
    pub group_change_pause_ms: u64,
    pub rc_timeout_ms: u64,
    pub driver_jitter_ms: u64,
    pub max_attempts: u32,
    pub moving_average_window: usize,
    pub placement: PlacementStrategy,
    pub skip_unchanged_actives: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        let defaults = controller::Config::new(NodeId(1), vec![NodeId(1)]);
        Self {
            num_primaries: defaults.num_primaries,
            min_replica: defaults.min_replica,
            max_replica: defaults.max_replica,
            normalizing_constant: defaults.normalizing_constant,
            analysis_interval_ms: defaults.analysis_interval_ms,
            analysis_initial_delay_ms: defaults.analysis_initial_delay_ms,
            group_change_pause_ms: defaults.group_change_pause_ms,
            rc_timeout_ms: defaults.rc_timeout_ms,
            driver_jitter_ms: defaults.driver_jitter_ms,
            max_attempts: defaults.max_attempts,
            moving_average_window: defaults.moving_average_window,
            placement: defaults.placement,
            skip_unchanged_actives: defaults.skip_unchanged_actives,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_ip: IpAddr,
    pub port: u16,
    /// Size of the standalone cluster; nodes are numbered from 1.
    pub nodes: u32,
    /// Node the HTTP API routes through.
    pub entry_node: NodeId,
    /// Per-node snapshot directories live under this path.
    pub storage_path: Option<PathBuf>,
    pub snapshot_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How often a node tells its peers how many names it serves.
    pub load_report_interval_ms: u64,
    pub consensus_timeout_ms: u64,
    pub remove_timeout_ms: u64,
    pub controller: ControllerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080, 3)
    }
}

impl Config {
    pub fn new(node_ip: IpAddr, port: u16, nodes: u32) -> Self {
        Self {
            node_ip,
            port,
            nodes,
            entry_node: NodeId(1),
            storage_path: None,
            snapshot_interval_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            load_report_interval_ms: 5_000,
            consensus_timeout_ms: 5_000,
            remove_timeout_ms: 60_000,
            controller: ControllerSettings::default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(GnsError::InvalidConfig("Cluster needs at least one node".to_string()));
        }
        if !self.node_ids().contains(&self.entry_node) {
            return Err(GnsError::InvalidConfig(format!(
                "Entry node {} is not in the cluster",
                self.entry_node
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.load_report_interval_ms == 0 {
            return Err(GnsError::InvalidConfig(
                "Heartbeat and load report intervals must be positive".to_string(),
            ));
        }
        self.controller_config(self.entry_node).validate()?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.node_ip, self.port)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        (1..=self.nodes).map(NodeId).collect()
    }

    pub fn consensus_config(&self, node_id: NodeId) -> consensus::Config {
        consensus::Config {
            node_id,
            consensus_timeout_ms: self.consensus_timeout_ms,
        }
    }

    pub fn network_config(&self, node_id: NodeId) -> network::Config {
        network::Config {
            node_id,
            peers: self.node_ids(),
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            failure_timeout_ms: self.heartbeat_interval_ms * 3,
        }
    }

    pub fn storage_config(&self, node_id: NodeId) -> storage::Config {
        storage::Config {
            storage_path: self
                .storage_path
                .as_ref()
                .map(|path| path.join(format!("node-{}", node_id))),
            snapshot_interval_ms: self.snapshot_interval_ms,
            moving_average_window: self.controller.moving_average_window,
        }
    }

    pub fn controller_config(&self, node_id: NodeId) -> controller::Config {
        let settings = &self.controller;
        controller::Config {
            node_id,
            nodes: self.node_ids(),
            num_primaries: settings.num_primaries,
            min_replica: settings.min_replica,
            max_replica: settings.max_replica,
            normalizing_constant: settings.normalizing_constant,
            analysis_interval_ms: settings.analysis_interval_ms,
            analysis_initial_delay_ms: settings.analysis_initial_delay_ms,
            group_change_pause_ms: settings.group_change_pause_ms,
            rc_timeout_ms: settings.rc_timeout_ms,
            driver_jitter_ms: settings.driver_jitter_ms,
            max_attempts: settings.max_attempts,
            moving_average_window: settings.moving_average_window,
            placement: settings.placement,
            skip_unchanged_actives: settings.skip_unchanged_actives,
        }
    }
}

impl From<Config> for api::Config {
    fn from(config: Config) -> Self {
        api::Config {
            node_ip: config.node_ip,
            port: config.port,
            remove_timeout_ms: config.remove_timeout_ms,
        }
    }
}
