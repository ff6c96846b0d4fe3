//! Consensus view identification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A consensus attempt, identified by (sequence, round).
///
/// The sequence strictly increases with each finalized block; the round
/// resets to zero on sequence advance and increases on timeouts or faults
/// within a sequence.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct View {
    /// Block height being agreed on.
    pub sequence: u64,
    /// Attempt number within the sequence.
    pub round: u64,
}

impl View {
    /// Create a view.
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }

    /// The first view of a sequence.
    pub fn round_zero(sequence: u64) -> Self {
        Self { sequence, round: 0 }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.sequence, self.round)
    }
}
