//! Replica counts and active-set membership.
//!
//! Every function here is deterministic for a given input, so any primary
//! that evaluates it for the same record reaches the same answer.

use consensus::NodeId;
use network::Liveness;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use storage::DemandStats;

use crate::PlacementStrategy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicaParams {
    pub min_replica: usize,
    pub max_replica: usize,
    pub total_nodes: usize,
    pub normalizing_constant: f64,
}

impl ReplicaParams {
    fn upper_bound(&self) -> usize {
        self.max_replica.min(self.total_nodes).max(1)
    }
}

/// Number of active replicas a name should have given its demand.
///
/// No demand keeps the minimum; read-only demand replicates everywhere;
/// otherwise the count grows with the lookup-to-update ratio and is clamped
/// to `[min_replica, min(max_replica, total_nodes)]`.
pub fn desired_replica_count(stats: &DemandStats, params: &ReplicaParams) -> usize {
    let (lookup_rate, update_rate) = stats.rates();
    replica_count_for_rates(lookup_rate, update_rate, params)
}

pub fn replica_count_for_rates(lookup_rate: f64, update_rate: f64, params: &ReplicaParams) -> usize {
    let upper = params.upper_bound();
    let lower = params.min_replica.min(upper);

    if update_rate <= 0.0 {
        if lookup_rate <= 0.0 {
            return lower;
        }
        // Read-only names go to every node; max_replica does not apply.
        return params.total_nodes;
    }

    let scaled = lookup_rate / (update_rate * params.normalizing_constant) + params.min_replica as f64;
    let count = if scaled.is_finite() {
        scaled.round() as usize
    } else {
        upper
    };
    count.clamp(lower, upper)
}

/// Stable per-name ordering of `nodes`. Seeded with the BLAKE3 hash of the
/// name so every process computes the same order.
pub fn seeded_order(name: &str, nodes: &[NodeId]) -> Vec<NodeId> {
    let digest = blake3::hash(name.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(digest.as_bytes());

    let mut ordered: Vec<NodeId> = nodes.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered.shuffle(&mut StdRng::from_seed(seed));
    ordered
}

pub fn primaries_for(name: &str, nodes: &[NodeId], count: usize) -> BTreeSet<NodeId> {
    seeded_order(name, nodes).into_iter().take(count).collect()
}

/// Initial active set for a new name: pseudo-random, disjoint from the
/// primaries where the node count allows.
pub fn initial_actives(
    name: &str,
    nodes: &[NodeId],
    primaries: &BTreeSet<NodeId>,
    count: usize,
) -> BTreeSet<NodeId> {
    let mut picker = Picker::new(count.min(nodes.len()));
    let order = seeded_order(name, nodes);
    for node in order.iter().filter(|node| !primaries.contains(*node)) {
        picker.offer(*node);
    }
    for node in &order {
        picker.offer(*node);
    }
    picker.finish()
}

/// What a policy may look at when choosing members for one name.
pub struct PlacementContext<'a> {
    pub name: &'a str,
    pub nodes: &'a [NodeId],
    pub current_actives: &'a BTreeSet<NodeId>,
    /// Voters ordered by vote count, highest first.
    pub ranked_voters: &'a [NodeId],
    pub loads: &'a HashMap<NodeId, f64>,
    pub liveness: Option<&'a dyn Liveness>,
}

impl PlacementContext<'_> {
    fn reachable(&self, node: NodeId) -> bool {
        self.liveness.map_or(true, |liveness| liveness.is_reachable(node))
    }
}

pub trait PlacementPolicy: Send + Sync {
    /// Chooses exactly `min(count, |nodes|)` members. Nodes in `exclude` and
    /// unreachable nodes are used only when nothing else is left.
    fn select_membership(
        &self,
        ctx: &PlacementContext<'_>,
        count: usize,
        exclude: &BTreeSet<NodeId>,
    ) -> BTreeSet<NodeId>;
}

pub fn policy_for(strategy: PlacementStrategy) -> Box<dyn PlacementPolicy> {
    match strategy {
        PlacementStrategy::Random => Box::new(RandomPlacement),
        PlacementStrategy::Locality => Box::new(LocalityPlacement),
        PlacementStrategy::LoadBalanced => Box::new(LoadBalancedPlacement),
    }
}

pub struct RandomPlacement;

impl PlacementPolicy for RandomPlacement {
    fn select_membership(
        &self,
        ctx: &PlacementContext<'_>,
        count: usize,
        exclude: &BTreeSet<NodeId>,
    ) -> BTreeSet<NodeId> {
        let mut picker = Picker::new(count.min(ctx.nodes.len()));
        fill(&mut picker, ctx, exclude);
        picker.finish()
    }
}

/// Nodes that reported the most lookups first, then the current actives,
/// then everything else.
pub struct LocalityPlacement;

impl PlacementPolicy for LocalityPlacement {
    fn select_membership(
        &self,
        ctx: &PlacementContext<'_>,
        count: usize,
        exclude: &BTreeSet<NodeId>,
    ) -> BTreeSet<NodeId> {
        let mut picker = Picker::new(count.min(ctx.nodes.len()));
        let eligible = |node: &&NodeId| {
            ctx.nodes.contains(*node) && !exclude.contains(*node) && ctx.reachable(**node)
        };

        for node in ctx.ranked_voters.iter().filter(eligible) {
            picker.offer(*node);
        }
        for node in ctx.current_actives.iter().filter(eligible) {
            picker.offer(*node);
        }
        fill(&mut picker, ctx, exclude);
        picker.finish()
    }
}

/// Least-loaded nodes first. Nodes without a load report count as idle.
pub struct LoadBalancedPlacement;

impl PlacementPolicy for LoadBalancedPlacement {
    fn select_membership(
        &self,
        ctx: &PlacementContext<'_>,
        count: usize,
        exclude: &BTreeSet<NodeId>,
    ) -> BTreeSet<NodeId> {
        let mut picker = Picker::new(count.min(ctx.nodes.len()));

        let mut by_load: Vec<NodeId> = ctx
            .nodes
            .iter()
            .filter(|node| !exclude.contains(*node) && ctx.reachable(**node))
            .copied()
            .collect();
        by_load.sort_by(|a, b| {
            let load_a = ctx.loads.get(a).copied().unwrap_or(0.0);
            let load_b = ctx.loads.get(b).copied().unwrap_or(0.0);
            load_a.total_cmp(&load_b).then(a.cmp(b))
        });
        for node in by_load {
            picker.offer(node);
        }
        fill(&mut picker, ctx, exclude);
        picker.finish()
    }
}

/// Tops up a selection in seeded order: reachable non-excluded nodes, then
/// reachable excluded ones, then the unreachable remainder.
fn fill(picker: &mut Picker, ctx: &PlacementContext<'_>, exclude: &BTreeSet<NodeId>) {
    let order = seeded_order(ctx.name, ctx.nodes);
    for pass in 0..3 {
        for node in &order {
            let accept = match pass {
                0 => !exclude.contains(node) && ctx.reachable(*node),
                1 => ctx.reachable(*node),
                _ => true,
            };
            if accept {
                picker.offer(*node);
            }
        }
    }
}

struct Picker {
    chosen: BTreeSet<NodeId>,
    target: usize,
}

impl Picker {
    fn new(target: usize) -> Self {
        Self {
            chosen: BTreeSet::new(),
            target,
        }
    }

    fn offer(&mut self, node: NodeId) {
        if self.chosen.len() < self.target {
            self.chosen.insert(node);
        }
    }

    fn finish(self) -> BTreeSet<NodeId> {
        self.chosen
    }
}
