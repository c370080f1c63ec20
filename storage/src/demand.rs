use consensus::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Fixed-size window over the most recent per-round samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingAverage {
    window: VecDeque<u64>,
    capacity: usize,
    sum: u64,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0,
        }
    }

    pub fn add(&mut self, sample: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        // Recomputed so a saturated sum recovers once the large sample leaves.
        self.sum = self
            .window
            .iter()
            .fold(0u64, |sum, sample| sum.saturating_add(*sample));
    }

    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.sum as f64 / self.window.len() as f64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDemand {
    pub reads: u64,
    pub writes: u64,
}

/// Lookup/update demand observed for one name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandStats {
    per_node: BTreeMap<NodeId, NodeDemand>,
    prev_total_reads: u64,
    prev_total_writes: u64,
    lookup_rate: MovingAverage,
    update_rate: MovingAverage,
}

impl DemandStats {
    pub fn new(window: usize) -> Self {
        Self {
            per_node: BTreeMap::new(),
            prev_total_reads: 0,
            prev_total_writes: 0,
            lookup_rate: MovingAverage::new(window),
            update_rate: MovingAverage::new(window),
        }
    }

    pub fn record(&mut self, node: NodeId, reads: u64, writes: u64) {
        let entry = self.per_node.entry(node).or_default();
        entry.reads = entry.reads.saturating_add(reads);
        entry.writes = entry.writes.saturating_add(writes);
        self.prev_total_reads = self.prev_total_reads.saturating_add(reads);
        self.prev_total_writes = self.prev_total_writes.saturating_add(writes);
    }

    /// Closes the current round: folds the round's totals into both windows
    /// and starts counting afresh. Returns `(lookup_rate, update_rate)`.
    pub fn roll_window(&mut self) -> (f64, f64) {
        self.lookup_rate.add(self.prev_total_reads);
        self.update_rate.add(self.prev_total_writes);
        self.prev_total_reads = 0;
        self.prev_total_writes = 0;
        self.rates()
    }

    pub fn rates(&self) -> (f64, f64) {
        (self.lookup_rate.average(), self.update_rate.average())
    }

    pub fn node_demand(&self, node: NodeId) -> NodeDemand {
        self.per_node.get(&node).copied().unwrap_or_default()
    }

    pub fn pending_totals(&self) -> (u64, u64) {
        (self.prev_total_reads, self.prev_total_writes)
    }
}
