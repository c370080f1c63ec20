use consensus::NodeId;
use network::Liveness;
use std::collections::BTreeSet;

/// Lowest-numbered primary the failure detector considers reachable.
pub fn elect_leader(primaries: &BTreeSet<NodeId>, liveness: &dyn Liveness) -> Option<NodeId> {
    primaries
        .iter()
        .find(|node| liveness.is_reachable(**node))
        .copied()
}

pub fn is_leader(local: NodeId, primaries: &BTreeSet<NodeId>, liveness: &dyn Liveness) -> bool {
    elect_leader(primaries, liveness) == Some(local)
}
