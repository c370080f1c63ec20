use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use storage::ActiveState;

use crate::coordinator::ReconfigurationCoordinator;
use crate::placement::desired_replica_count;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub scanned: usize,
    pub proposed: usize,
    pub not_leader: usize,
    pub in_flight: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Periodically recomputes the active set of every name this node leads.
pub struct ReconfigurationScheduler {
    coordinator: Arc<ReconfigurationCoordinator>,
}

impl ReconfigurationScheduler {
    pub fn new(coordinator: Arc<ReconfigurationCoordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn run(&self) {
        let config = self.coordinator.config();
        tokio::time::sleep(Duration::from_millis(config.analysis_initial_delay_ms)).await;

        let mut interval =
            tokio::time::interval(Duration::from_millis(config.analysis_interval_ms));
        loop {
            interval.tick().await;

            match self.run_round().await {
                Ok(summary) => tracing::info!(
                    "Reconfiguration round on node {}: {:?}",
                    self.coordinator.node_id(),
                    summary
                ),
                Err(e) => tracing::error!("Reconfiguration round failed: {}", e),
            }
        }
    }

    /// One pass over the local records. Demand windows are rolled for every
    /// record; proposals are made only for records this node leads.
    pub async fn run_round(&self) -> Result<RoundSummary> {
        let coordinator = &self.coordinator;
        let config = coordinator.config();
        let local = coordinator.node_id();
        let params = config.replica_params();
        let pause = Duration::from_millis(config.group_change_pause_ms);

        let mut summary = RoundSummary::default();
        for stored in coordinator.store().scan_all().await? {
            summary.scanned += 1;

            let record = match coordinator.roll_demand_window(stored.name()).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Failed to roll demand for {}: {}", stored.name(), e);
                    summary.failed += 1;
                    continue;
                }
            };

            if record.is_marked_for_removal() {
                summary.removed += 1;
                continue;
            }
            if !record.is_primary(local) || coordinator.leader_for(record.primaries()) != Some(local) {
                summary.not_leader += 1;
                continue;
            }
            if record.compute_state() != ActiveState::ActiveRunning {
                tracing::debug!("Skipping {}: reconfiguration in flight", record.name());
                summary.in_flight += 1;
                continue;
            }

            let count = desired_replica_count(&record.demand, &params);
            let actives = coordinator.select_actives(&record, count);
            if actives.is_empty() {
                tracing::warn!("No active set available for {}", record.name());
                summary.failed += 1;
                continue;
            }
            if config.skip_unchanged_actives && actives == *record.active_set() {
                summary.unchanged += 1;
                continue;
            }

            match coordinator.propose_new_actives(&record, actives.clone()).await {
                Ok(Some(transition_id)) => {
                    tracing::info!(
                        "Proposed actives {:?} ({}) for {}",
                        actives,
                        transition_id,
                        record.name()
                    );
                    summary.proposed += 1;
                }
                Ok(None) => {
                    tracing::debug!("Proposal for {} not accepted", record.name());
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to propose actives for {}: {}", record.name(), e);
                    summary.failed += 1;
                }
            }

            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        Ok(summary)
    }
}
