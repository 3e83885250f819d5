// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free window functions for each indicator, plus the
// per-timeframe `IndicatorSet` that applies them to the tail of a bar ring
// at most once per closed bar, in a fixed order: price, momentum, trend,
// volatility, support/resistance, volume.
//
// Every window function returns `Option<T>` (or an empty series) so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod pivot;
pub mod rsi;
pub mod sma;

use serde::{Deserialize, Serialize};

use crate::bars::BarSeries;
use crate::timeframe::Timeframe;
use crate::types::Direction;

use bollinger::BollingerBands;
use pivot::PivotResult;

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// What an indicator measures. The variant order is the update order of the
/// [`IndicatorSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndicatorType {
    AveragePrice,
    Momentum,
    Trend,
    Volatility,
    SupportResistance,
    Volume,
}

/// How an indicator's output relates to price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicatorClass {
    Cumulative,
    Index,
    Oscillator,
    Overlay,
}

/// Declared type and class of every indicator in the set, in update order.
pub const INDICATOR_TAXONOMY: &[(&str, IndicatorType, IndicatorClass)] = &[
    ("price", IndicatorType::AveragePrice, IndicatorClass::Overlay),
    ("rsi", IndicatorType::Momentum, IndicatorClass::Oscillator),
    ("sma", IndicatorType::Trend, IndicatorClass::Overlay),
    ("ema", IndicatorType::Trend, IndicatorClass::Overlay),
    ("sma55", IndicatorType::Trend, IndicatorClass::Overlay),
    ("atr", IndicatorType::Volatility, IndicatorClass::Index),
    ("bollinger", IndicatorType::Volatility, IndicatorClass::Overlay),
    ("pivotpoint", IndicatorType::SupportResistance, IndicatorClass::Overlay),
    ("volume", IndicatorType::Volume, IndicatorClass::Cumulative),
];

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Lookbacks of the configured indicator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub sma_period: usize,
    pub ema_period: usize,
    pub sma55_period: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub volume_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 21,
            sma_period: 20,
            ema_period: 8,
            sma55_period: 55,
            atr_period: 14,
            atr_multiplier: 1.5,
            bollinger_period: 20,
            bollinger_std: 2.0,
            volume_period: 20,
        }
    }
}

impl IndicatorParams {
    /// The longest lookback of the set; sizes the bar ring buffers.
    pub fn max_lookback(&self) -> usize {
        self.rsi_period
            .max(self.sma_period)
            .max(self.ema_period)
            .max(self.sma55_period)
            .max(self.atr_period + 1)
            .max(self.bollinger_period)
            .max(self.volume_period)
    }
}

// ---------------------------------------------------------------------------
// IndicatorSet
// ---------------------------------------------------------------------------

/// Rolling indicator state for one (instrument, timeframe).
///
/// `update` recomputes every indicator from the tail of the bar window, so a
/// full replay of the same bars yields exactly the same state as the
/// incremental updates did.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    timeframe: Timeframe,
    params: IndicatorParams,
    /// Open time of the newest closed bar consumed so far.
    last_timestamp: f64,

    pub price: Option<f64>,
    pub rsi: Option<f64>,
    pub sma: Option<f64>,
    pub ema: Option<f64>,
    pub sma55: Option<f64>,
    pub atr: Option<f64>,
    pub bollinger: Option<BollingerBands>,
    pub pivot: Option<PivotResult>,
    pub volume_sma: Option<f64>,
}

impl IndicatorSet {
    pub fn new(timeframe: Timeframe, params: IndicatorParams) -> Self {
        Self {
            timeframe,
            params,
            last_timestamp: -1.0,
            price: None,
            rsi: None,
            sma: None,
            ema: None,
            sma55: None,
            atr: None,
            bollinger: None,
            pivot: None,
            volume_sma: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    /// Consume the newest closed bar of `series`, if any. Each closed bar is
    /// applied at most once; repeated calls without a new close are no-ops.
    ///
    /// Returns true when the set advanced.
    pub fn update(&mut self, series: &BarSeries) -> bool {
        let newest = match series.last_closed() {
            Some(bar) => *bar,
            None => return false,
        };

        if newest.timestamp <= self.last_timestamp {
            return false;
        }

        let window = self.params.max_lookback();
        let bars = series.tail(window, false);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        // price
        self.price = closes.last().copied();

        // momentum
        self.rsi = rsi::relative_strength_index(&closes, self.params.rsi_period);

        // trend
        self.sma = sma::calculate_sma(&closes, self.params.sma_period);
        self.ema = ema::exponential_average(&closes, self.params.ema_period);
        self.sma55 = sma::calculate_sma(&closes, self.params.sma55_period);

        // volatility
        self.atr = atr::average_true_range(&bars, self.params.atr_period);
        self.bollinger = bollinger::bollinger_bands(
            &closes,
            self.params.bollinger_period,
            self.params.bollinger_std,
        );

        // support/resistance
        self.pivot = pivot::calculate_pivot(&newest);

        // volume
        self.volume_sma = sma::calculate_sma(&volumes, self.params.volume_period);

        self.last_timestamp = newest.timestamp;
        true
    }

    /// ATR-derived protective stop level for the given direction, anchored
    /// on the last close.
    pub fn atr_stop_loss(&self, direction: Direction) -> Option<f64> {
        let price = self.price?;
        let atr = self.atr?;
        Some(match direction {
            Direction::Long => price - self.params.atr_multiplier * atr,
            Direction::Short => price + self.params.atr_multiplier * atr,
        })
    }

    /// The last pivot resistances, nearest first (R1, R2, R3).
    pub fn last_resistances(&self) -> Option<[f64; 3]> {
        self.pivot.as_ref().map(|p| p.resistances)
    }

    /// The last pivot supports, nearest first (S1, S2, S3).
    pub fn last_supports(&self) -> Option<[f64; 3]> {
        self.pivot.as_ref().map(|p| p.supports)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;

    fn filled_series(bar_count: usize) -> BarSeries {
        let mut series = BarSeries::new(Timeframe::T1M, 120);
        for i in 0..=bar_count {
            let base = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05;
            series.ingest(&Tick::new(i as f64 * 60.0, base, 10.0));
            series.ingest(&Tick::new(i as f64 * 60.0 + 30.0, base + 0.5, 5.0));
        }
        series
    }

    #[test]
    fn update_consumes_each_closed_bar_once() {
        let series = filled_series(80);
        let mut set = IndicatorSet::new(Timeframe::T1M, IndicatorParams::default());

        assert!(set.update(&series));
        assert!(set.price.is_some());
        assert!(set.rsi.is_some());
        assert!(set.sma.is_some());
        assert!(set.ema.is_some());
        assert!(set.sma55.is_some());
        assert!(set.atr.is_some());
        assert!(set.bollinger.is_some());
        assert!(set.pivot.is_some());
        assert!(set.volume_sma.is_some());

        // Same series, no new closed bar: no-op.
        assert!(!set.update(&series));
    }

    #[test]
    fn replay_equals_incremental() {
        let params = IndicatorParams::default();

        // Incremental: update after every closed bar.
        let mut inc_series = BarSeries::new(Timeframe::T1M, 120);
        let mut inc_set = IndicatorSet::new(Timeframe::T1M, params.clone());
        for i in 0..=90 {
            let price = 100.0 + (i as f64 * 0.2).cos() * 3.0 + i as f64 * 0.1;
            inc_series.ingest(&Tick::new(i as f64 * 60.0, price, 7.0));
            inc_set.update(&inc_series);
        }

        // Replay: one single update over the full history.
        let mut replay_set = IndicatorSet::new(Timeframe::T1M, params);
        replay_set.update(&inc_series);

        assert_eq!(inc_set.price, replay_set.price);
        assert_eq!(inc_set.sma, replay_set.sma);
        assert_eq!(inc_set.sma55, replay_set.sma55);
        assert_eq!(inc_set.rsi, replay_set.rsi);
        assert_eq!(inc_set.atr, replay_set.atr);
        assert_eq!(inc_set.volume_sma, replay_set.volume_sma);
    }

    #[test]
    fn atr_stop_sides() {
        let series = filled_series(60);
        let mut set = IndicatorSet::new(Timeframe::T1M, IndicatorParams::default());
        set.update(&series);

        let price = set.price.unwrap();
        let long_stop = set.atr_stop_loss(Direction::Long).unwrap();
        let short_stop = set.atr_stop_loss(Direction::Short).unwrap();
        assert!(long_stop < price);
        assert!(short_stop > price);
    }

    #[test]
    fn empty_series_yields_nothing() {
        let series = BarSeries::new(Timeframe::T1M, 10);
        let mut set = IndicatorSet::new(Timeframe::T1M, IndicatorParams::default());
        assert!(!set.update(&series));
        assert!(set.price.is_none());
    }

    #[test]
    fn taxonomy_is_in_update_order() {
        // The declared taxonomy follows the fixed update order:
        // price, momentum, trend, volatility, support/resistance, volume.
        let types: Vec<IndicatorType> =
            INDICATOR_TAXONOMY.iter().map(|(_, t, _)| *t).collect();
        let mut sorted = types.clone();
        sorted.sort();
        assert_eq!(types, sorted);
        assert_eq!(INDICATOR_TAXONOMY.len(), 9);
        assert_eq!(INDICATOR_TAXONOMY[0].0, "price");
        assert_eq!(INDICATOR_TAXONOMY[8].2, IndicatorClass::Cumulative);
    }
}
