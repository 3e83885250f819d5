// =============================================================================
// Timeframe — bar durations forming a chained hierarchy per strategy
// =============================================================================
//
// A timeframe is an integer duration in seconds. The configured set of a
// strategy is totally ordered; each non-root timeframe must be an integer
// multiple of its parent (the next larger configured timeframe).

use serde::{Deserialize, Serialize};

/// A bar duration in whole seconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timeframe(pub u32);

impl Timeframe {
    pub const T1M: Timeframe = Timeframe(60);
    pub const T5M: Timeframe = Timeframe(5 * 60);
    pub const T15M: Timeframe = Timeframe(15 * 60);
    pub const T1H: Timeframe = Timeframe(60 * 60);
    pub const T2H: Timeframe = Timeframe(2 * 60 * 60);
    pub const T4H: Timeframe = Timeframe(4 * 60 * 60);
    pub const T1D: Timeframe = Timeframe(24 * 60 * 60);

    pub fn seconds(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0)
    }

    /// Index of the bar containing `timestamp` (seconds since epoch).
    pub fn bucket(self, timestamp: f64) -> i64 {
        (timestamp / self.as_f64()).floor() as i64
    }

    /// Open timestamp of the bar containing `timestamp`.
    pub fn align(self, timestamp: f64) -> f64 {
        self.bucket(timestamp) as f64 * self.as_f64()
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0;
        if s == 0 {
            write!(f, "t")
        } else if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{}s", s)
        }
    }
}

/// An ordered chain of timeframes, leaf (smallest) to root (largest).
///
/// Validates the integer-multiplicity constraint between neighbours and
/// answers parent lookups for signal filtering and stop derivation.
#[derive(Debug, Clone)]
pub struct TimeframeChain {
    ordered: Vec<Timeframe>,
}

impl TimeframeChain {
    /// Build a chain from an arbitrary set. Duplicates are collapsed.
    ///
    /// Returns `None` when the set is empty or a member is not an integer
    /// multiple of its predecessor.
    pub fn new(mut timeframes: Vec<Timeframe>) -> Option<Self> {
        timeframes.sort_unstable();
        timeframes.dedup();

        if timeframes.is_empty() {
            return None;
        }

        for pair in timeframes.windows(2) {
            if pair[1].0 % pair[0].0 != 0 {
                return None;
            }
        }

        Some(Self {
            ordered: timeframes,
        })
    }

    /// Smallest timeframe: the tick-aggregation layer.
    pub fn base(&self) -> Timeframe {
        self.ordered[0]
    }

    /// Largest timeframe.
    pub fn root(&self) -> Timeframe {
        *self.ordered.last().expect("chain is never empty")
    }

    /// Next larger configured timeframe, or the root itself for the root.
    pub fn parent(&self, timeframe: Timeframe) -> Timeframe {
        match self.ordered.iter().position(|&tf| tf == timeframe) {
            Some(idx) if idx + 1 < self.ordered.len() => self.ordered[idx + 1],
            _ => self.root(),
        }
    }

    pub fn contains(&self, timeframe: Timeframe) -> bool {
        self.ordered.contains(&timeframe)
    }

    pub fn iter(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.ordered.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
