//! Compilation tiers and the per-module tiering strategy.
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A compilation tier. Ordered from worst to best code quality.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Tier {
    /// Fast single-pass code generation.
    Baseline,
    /// Optimizing code generation.
    Optimized,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Baseline => "baseline",
            Self::Optimized => "optimized",
        })
    }
}

/// How a module moves between tiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CompileMode {
    /// A single tier is compiled and nothing follows it.
    Once,
    /// The whole module is compiled with baseline first, then optimized in
    /// the background and switched over in one step.
    EagerTiering,
    /// Baseline first, then individual functions are optimized when their
    /// call counters ask for it.
    LazyTiering,
}

impl CompileMode {
    /// Whether the baseline tier's tier entries are live.
    pub fn is_tiering(self) -> bool {
        !matches!(self, Self::Once)
    }
}

/// State of a function in the lazy tiering lattice. Transitions only move
/// forward: `NotRequested -> Requested -> Finished`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TierUpState {
    /// Nobody asked for a better tier yet.
    NotRequested = 0,
    /// A background compilation was requested.
    Requested = 1,
    /// The optimized code is installed.
    Finished = 2,
}

impl TierUpState {
    /// Decode the value stored in an atomic.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotRequested,
            1 => Self::Requested,
            2 => Self::Finished,
            _ => panic!("invalid tier-up state {raw}"),
        }
    }
}
