//! Connectivity phases.
//!
//! [`phase`] classifies a degree against the `[kmin, kmax)` target range;
//! [`PhaseTracker`] turns raw connection events into that degree.
pub mod tracker;

pub use tracker::PhaseTracker;

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// Qualitative connectivity state of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// No host connections.
    Orphaned,
    /// Connected, below `kmin`.
    Partial,
    /// Within `[kmin, kmax)`.
    Complete,
    /// At or above `kmax`.
    Overloaded,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Orphaned => "orphaned",
            Phase::Partial => "partial",
            Phase::Complete => "complete",
            Phase::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/// Classify degree `n` against `[kmin, kmax)`.
pub fn phase(n: usize, kmin: usize, kmax: usize) -> Phase {
    if n == 0 {
        Phase::Orphaned
    } else if n < kmin {
        Phase::Partial
    } else if n < kmax {
        Phase::Complete
    } else {
        Phase::Overloaded
    }
}

/// Emitted when a peer's first connection opens or its last one closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChangeEvent {
    /// Peer whose connection triggered the change.
    pub peer: PeerId,
    pub from: Phase,
    pub to: Phase,
    /// Host degree after the change.
    pub n: usize,
}

/// Latest phase and degree, published on the handle's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub degree: usize,
}

impl Default for PhaseSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Orphaned,
            degree: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn phase_table() {
        assert_eq!(phase(0, 3, 6), Phase::Orphaned);
        assert_eq!(phase(1, 3, 6), Phase::Partial);
        assert_eq!(phase(2, 3, 6), Phase::Partial);
        assert_eq!(phase(3, 3, 6), Phase::Complete);
        assert_eq!(phase(5, 3, 6), Phase::Complete);
        assert_eq!(phase(6, 3, 6), Phase::Overloaded);
        assert_eq!(phase(100, 3, 6), Phase::Overloaded);
    }

    #[test]
    fn display() {
        assert_eq!(Phase::Overloaded.to_string(), "overloaded");
    }

    proptest! {
        #[test]
        fn phase_is_total_and_consistent(n in 0usize..1000, kmin in 1usize..50, width in 1usize..50) {
            let kmax = kmin + width;
            let p = phase(n, kmin, kmax);
            prop_assert_eq!(p, phase(n, kmin, kmax));
            match p {
                Phase::Orphaned => prop_assert_eq!(n, 0),
                Phase::Partial => prop_assert!(n > 0 && n < kmin),
                Phase::Complete => prop_assert!(n >= kmin && n < kmax),
                Phase::Overloaded => prop_assert!(n >= kmax),
            }
        }

        #[test]
        fn phase_is_monotonic_in_degree(n in 0usize..1000, kmin in 1usize..50, width in 1usize..50) {
            let kmax = kmin + width;
            let rank = |p: Phase| p as u8;
            prop_assert!(rank(phase(n, kmin, kmax)) <= rank(phase(n + 1, kmin, kmax)));
        }
    }
}
