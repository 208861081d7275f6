//! Walk strategy selection

use crate::error::SyncError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Algorithm used to walk the table forest.
///
/// All strategies produce the same rows; they differ in how fairly work is
/// spread across tables and clients under rate limiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Task per table invocation, children spawned per parent row
    #[default]
    Dfs,
    /// DFS engine over roots interleaved client by client
    RoundRobin,
    /// DFS engine over a deterministic shuffle of the round-robin order
    Shuffle,
    /// Worker pool over a queue that pops uniformly at random
    RandomQueue,
    /// Worker pool over a queue favouring pairs with less queued work
    PriorityQueue,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Dfs,
        Strategy::RoundRobin,
        Strategy::Shuffle,
        Strategy::RandomQueue,
        Strategy::PriorityQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dfs => "dfs",
            Self::RoundRobin => "round-robin",
            Self::Shuffle => "shuffle",
            Self::RandomQueue => "random-queue",
            Self::PriorityQueue => "priority-queue",
        }
    }

    /// Queue strategies use a worker pool instead of per-row tasks
    pub fn is_queue_based(&self) -> bool {
        matches!(self, Self::RandomQueue | Self::PriorityQueue)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| SyncError::UnknownStrategy(s.to_string()))
    }
}
