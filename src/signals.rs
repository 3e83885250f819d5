// =============================================================================
// Strategy signals — candidate entries and exits emitted per timeframe
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;
use crate::types::Direction;

/// Whether a signal proposes opening or closing exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Entry,
    Exit,
}

/// A candidate signal produced by a timeframe analyser.
///
/// The trader may enrich a candidate with a derived stop or target before
/// retaining it; once retained and acted upon the signal is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub kind: SignalKind,
    /// Timeframe that generated the signal.
    pub timeframe: Timeframe,
    pub price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// Indicator readings that triggered the signal, for trade statistics.
    #[serde(default)]
    pub conditions: BTreeMap<String, f64>,
    pub timestamp: f64,
}

impl Signal {
    pub fn new(
        direction: Direction,
        kind: SignalKind,
        timeframe: Timeframe,
        price: f64,
        timestamp: f64,
    ) -> Self {
        Self {
            direction,
            kind,
            timeframe,
            price,
            stop_loss: None,
            take_profit: None,
            conditions: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_condition(mut self, name: &str, value: f64) -> Self {
        self.conditions.insert(name.to_string(), value);
        self
    }

    pub fn is_entry(&self) -> bool {
        self.kind == SignalKind::Entry
    }

    pub fn is_exit(&self) -> bool {
        self.kind == SignalKind::Exit
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} @{} tf={}",
            self.kind, self.direction, self.price, self.timeframe
        )
    }
}
