use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Coarse stages of one reconfiguration, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    StopSent = 1,
    OldActiveStopped = 2,
    NewActiveStarted = 3,
}

impl Stage {
    pub const INITIAL: Stage = Stage::StopSent;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
    pub since: DateTime<Utc>,
}

/// Local, non-replicated view of how far each in-flight reconfiguration has
/// progressed. Used for reporting only; the record itself stays the source
/// of truth.
#[derive(Default)]
pub struct ProgressTracker {
    stages: Mutex<HashMap<String, StageEntry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `name` to `stage`. Succeeds only when `stage` is strictly past
    /// the recorded one, or nothing is recorded and `stage` is the initial
    /// stage.
    pub fn advance(&self, name: &str, stage: Stage) -> bool {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = match stages.get(name) {
            Some(entry) => stage > entry.stage,
            None => stage == Stage::INITIAL,
        };

        if allowed {
            stages.insert(
                name.to_string(),
                StageEntry {
                    stage,
                    since: Utc::now(),
                },
            );
        }
        allowed
    }

    pub fn complete(&self, name: &str) {
        self.stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn stage(&self, name: &str) -> Option<StageEntry> {
        self.stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    pub fn in_flight(&self) -> usize {
        self.stages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
