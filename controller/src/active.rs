use chrono::{DateTime, Utc};
use consensus::{GroupId, NodeId, TransitionId};
use network::{ActiveSetRequest, ActiveSetResponse, Liveness};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::driver::Direction;

/// Generation of a name this node currently serves as an active replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveGeneration {
    pub transition_id: TransitionId,
    pub members: BTreeSet<NodeId>,
    pub since: DateTime<Utc>,
}

/// A start or stop this node relayed to the rest of a set, waiting for
/// member acknowledgments.
#[derive(Debug, Clone)]
struct Relay {
    direction: Direction,
    request: ActiveSetRequest,
    acked: BTreeSet<NodeId>,
}

impl Relay {
    /// A start settles on a majority of the new set; a stop only once no
    /// reachable member of the old set is left serving.
    fn settled(&self, liveness: &dyn Liveness) -> bool {
        let members = &self.request.target_set;
        match self.direction {
            Direction::Start => {
                let started = members.iter().filter(|m| self.acked.contains(*m)).count();
                started > members.len() / 2
            }
            Direction::Stop => members
                .iter()
                .all(|m| self.acked.contains(m) || !liveness.is_reachable(*m)),
        }
    }
}

/// Active-replica side of start/stop requests.
pub struct ActiveReplicas {
    node_id: NodeId,
    serving: RwLock<HashMap<String, ActiveGeneration>>,
    relays: Mutex<HashMap<Uuid, Relay>>,
}

impl ActiveReplicas {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            serving: RwLock::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle_start(&self, request: &ActiveSetRequest) -> ActiveSetResponse {
        let mut serving = self.serving.write().await;
        let replaced = serving.insert(
            request.name.clone(),
            ActiveGeneration {
                transition_id: request.transition_id,
                members: request.target_set.clone(),
                since: Utc::now(),
            },
        );

        match replaced {
            Some(previous) if previous.transition_id != request.transition_id => {
                tracing::info!(
                    "Node {} now serves {} for {} (was {})",
                    self.node_id,
                    request.name,
                    request.transition_id,
                    previous.transition_id
                );
            }
            Some(_) => {}
            None => {
                tracing::info!(
                    "Node {} started serving {} for {}",
                    self.node_id,
                    request.name,
                    request.transition_id
                );
            }
        }

        self.response(request)
    }

    /// Stops serving the requested generation. A newer generation already
    /// in place is left alone; the reply still confirms the requested one
    /// is not served here.
    pub async fn handle_stop(&self, request: &ActiveSetRequest) -> ActiveSetResponse {
        let mut serving = self.serving.write().await;
        let matches = serving
            .get(&request.name)
            .map_or(false, |generation| generation.transition_id == request.transition_id);

        if matches {
            serving.remove(&request.name);
            tracing::info!(
                "Node {} stopped serving {} for {}",
                self.node_id,
                request.name,
                request.transition_id
            );
        }

        self.response(request)
    }

    /// Applies `request` here and starts waiting for the rest of its set.
    /// Any earlier relay for the same name is dropped. Returns the members
    /// the request still has to reach.
    pub async fn begin_relay(
        &self,
        direction: Direction,
        request: &ActiveSetRequest,
    ) -> BTreeSet<NodeId> {
        match direction {
            Direction::Start => self.handle_start(request).await,
            Direction::Stop => self.handle_stop(request).await,
        };

        let mut acked = BTreeSet::new();
        if request.target_set.contains(&self.node_id) {
            acked.insert(self.node_id);
        }

        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        relays.retain(|_, relay| relay.request.name != request.name);
        relays.insert(
            request.request_id,
            Relay {
                direction,
                request: request.clone(),
                acked,
            },
        );

        request
            .target_set
            .iter()
            .copied()
            .filter(|member| *member != self.node_id)
            .collect()
    }

    /// Counts a member's acknowledgment. Returns false when no relay is
    /// waiting for it.
    pub fn record_member_ack(&self, response: &ActiveSetResponse) -> bool {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        match relays.get_mut(&response.request_id) {
            Some(relay) if relay.request.target_set.contains(&response.responder) => {
                relay.acked.insert(response.responder);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every relay whose set has settled, together with
    /// the answer owed to its proposer.
    pub fn take_settled(
        &self,
        liveness: &dyn Liveness,
    ) -> Vec<(Direction, NodeId, ActiveSetResponse)> {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        let settled: Vec<Uuid> = relays
            .iter()
            .filter(|(_, relay)| relay.settled(liveness))
            .map(|(id, _)| *id)
            .collect();

        settled
            .into_iter()
            .filter_map(|id| relays.remove(&id))
            .map(|relay| {
                tracing::debug!(
                    "Node {} settled {} of {} with {:?}",
                    self.node_id,
                    relay.direction,
                    relay.request.name,
                    relay.acked
                );
                (relay.direction, relay.request.proposer, self.response(&relay.request))
            })
            .collect()
    }

    pub fn pending_relays(&self) -> usize {
        self.relays.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn is_serving(&self, name: &str) -> bool {
        self.serving.read().await.contains_key(name)
    }

    pub async fn generation(&self, name: &str) -> Option<ActiveGeneration> {
        self.serving.read().await.get(name).cloned()
    }

    /// Number of names served here; reported to peers as this node's load.
    pub async fn serving_count(&self) -> usize {
        self.serving.read().await.len()
    }

    fn response(&self, request: &ActiveSetRequest) -> ActiveSetResponse {
        ActiveSetResponse {
            request_id: request.request_id,
            name: request.name.clone(),
            transition_id: request.transition_id,
            group: GroupId::active(&request.name, request.transition_id),
            responder: self.node_id,
        }
    }
}
