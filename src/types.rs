// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade/order direction. Serialized as `"long"` / `"short"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Signed factor used by P/L arithmetic: +1 for long, -1 for short.
    pub fn factor(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// The closing direction (opposite side).
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    pub fn from_factor(value: f64) -> Option<Self> {
        if value > 0.0 {
            Some(Self::Long)
        } else if value < 0.0 {
            Some(Self::Short)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// A normalized market tick: last traded price and volume at a timestamp.
///
/// Timestamps are seconds since the Unix epoch (fractional).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: f64,
    pub price: f64,
    pub volume: f64,
}

impl Tick {
    pub fn new(timestamp: f64, price: f64, volume: f64) -> Self {
        Self {
            timestamp,
            price,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_factor_and_opposite() {
        assert_eq!(Direction::Long.factor(), 1.0);
        assert_eq!(Direction::Short.factor(), -1.0);
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
    }

    #[test]
    fn direction_from_factor() {
        assert_eq!(Direction::from_factor(1.0), Some(Direction::Long));
        assert_eq!(Direction::from_factor(-2.5), Some(Direction::Short));
        assert_eq!(Direction::from_factor(0.0), None);
    }

    #[test]
    fn direction_serde_roundtrip() {
        let json = serde_json::to_string(&Direction::Long).unwrap();
        assert_eq!(json, "\"long\"");
        let back: Direction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Direction::Long);
    }
}
