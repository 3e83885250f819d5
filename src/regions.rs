// =============================================================================
// Trade regions — user-defined price ranges gating entry signals
// =============================================================================
//
// A region is a price range, optionally bound to a direction and an expiry.
// With no region configured every signal passes when `region-allow` is set;
// once regions exist, a signal must sit inside at least one matching region.

use serde::{Deserialize, Serialize};

use crate::signals::Signal;
use crate::types::Direction;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TradeRegion {
    pub low: f64,
    pub high: f64,
    /// Restrict the region to one direction; `None` applies to both.
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Unix timestamp after which the region no longer applies (0 = never).
    #[serde(default)]
    pub expiry: f64,
}

impl TradeRegion {
    pub fn contains(&self, signal: &Signal) -> bool {
        if self.expiry > 0.0 && signal.timestamp > self.expiry {
            return false;
        }

        if let Some(direction) = self.direction {
            if direction != signal.direction {
                return false;
            }
        }

        self.low <= signal.price && signal.price <= self.high
    }
}

/// Entry admission check against the configured regions.
pub fn check_regions(signal: &Signal, regions: &[TradeRegion], region_allow: bool) -> bool {
    if regions.is_empty() {
        return region_allow;
    }

    regions.iter().any(|region| region.contains(signal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalKind;
    use crate::timeframe::Timeframe;

    fn signal(price: f64, timestamp: f64) -> Signal {
        Signal::new(
            Direction::Long,
            SignalKind::Entry,
            Timeframe::T15M,
            price,
            timestamp,
        )
    }

    #[test]
    fn no_regions_follows_the_allow_flag() {
        let s = signal(100.0, 0.0);
        assert!(check_regions(&s, &[], true));
        assert!(!check_regions(&s, &[], false));
    }

    #[test]
    fn inside_region_passes() {
        let regions = vec![TradeRegion {
            low: 90.0,
            high: 110.0,
            direction: None,
            expiry: 0.0,
        }];
        assert!(check_regions(&signal(100.0, 0.0), &regions, true));
        assert!(!check_regions(&signal(120.0, 0.0), &regions, true));
    }

    #[test]
    fn direction_and_expiry_restrict() {
        let regions = vec![TradeRegion {
            low: 90.0,
            high: 110.0,
            direction: Some(Direction::Short),
            expiry: 1_000.0,
        }];
        // Long signal against a short-only region.
        assert!(!check_regions(&signal(100.0, 0.0), &regions, true));

        let mut short = signal(100.0, 0.0);
        short.direction = Direction::Short;
        assert!(check_regions(&short, &regions, true));

        // Expired region.
        let mut late = signal(100.0, 2_000.0);
        late.direction = Direction::Short;
        assert!(!check_regions(&late, &regions, true));
    }
}
