// =============================================================================
// Timeframe Analyser — sub-strategy signal rules per timeframe
// =============================================================================
//
// One analyser per configured timeframe, bound to a sub-strategy mode:
//
//   A — trend pullback: enter long on EMA above SMA with RSI pulled back;
//       exit when the averages cross down or RSI is stretched.
//   B — band reversion: enter long below the lower Bollinger band with RSI
//       oversold; exit above the upper band.
//   C — pivot breakout: enter long on a close crossing above R1 with the
//       stop at the pivot; exit on a close crossing below S1.
//
// The analyser yields candidates only; acting on them is the strategy
// trader's decision.

use tracing::debug;

use crate::bars::BarSeries;
use crate::config::SubStrategyMode;
use crate::indicators::{IndicatorParams, IndicatorSet};
use crate::signals::{Signal, SignalKind};
use crate::timeframe::Timeframe;
use crate::types::Direction;

/// Major trend estimate from a reference-timeframe indicator set:
/// `sign(ema - sma)` when the reference set is fully formed, else 0.
pub fn major_trend(reference: &IndicatorSet) -> i32 {
    match (
        reference.price,
        reference.sma,
        reference.ema,
        reference.sma55,
        reference.rsi,
    ) {
        (Some(_), Some(sma), Some(ema), Some(_), Some(_)) => {
            if ema > sma {
                1
            } else if ema < sma {
                -1
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// Per-timeframe analyser: rolling indicators plus the mode's signal rules.
#[derive(Debug)]
pub struct TimeframeAnalyser {
    timeframe: Timeframe,
    mode: SubStrategyMode,
    indicators: IndicatorSet,
    /// Close and pivot of the previous closed bar, for crossing detection.
    prev_close: Option<f64>,
    prev_r1: Option<f64>,
    prev_s1: Option<f64>,
}

impl TimeframeAnalyser {
    pub fn new(timeframe: Timeframe, mode: SubStrategyMode, params: IndicatorParams) -> Self {
        Self {
            timeframe,
            mode,
            indicators: IndicatorSet::new(timeframe, params),
            prev_close: None,
            prev_r1: None,
            prev_s1: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn mode(&self) -> SubStrategyMode {
        self.mode
    }

    pub fn indicators(&self) -> &IndicatorSet {
        &self.indicators
    }

    /// Advance on the series' newest closed bar and emit candidate signals.
    ///
    /// Returns an empty vec when no new bar closed since the last call.
    pub fn update(&mut self, series: &BarSeries, timestamp: f64) -> Vec<Signal> {
        // Capture crossing references before the set advances.
        let prev_close = self.prev_close;
        let prev_r1 = self.prev_r1;
        let prev_s1 = self.prev_s1;

        if !self.indicators.update(series) {
            return Vec::new();
        }

        self.prev_close = self.indicators.price;
        self.prev_r1 = self.indicators.last_resistances().map(|r| r[0]);
        self.prev_s1 = self.indicators.last_supports().map(|s| s[0]);

        let signals = self.evaluate(prev_close, prev_r1, prev_s1, timestamp);
        for signal in &signals {
            debug!(timeframe = %self.timeframe, mode = ?self.mode, signal = %signal, "candidate signal");
        }
        signals
    }

    fn evaluate(
        &self,
        prev_close: Option<f64>,
        prev_r1: Option<f64>,
        prev_s1: Option<f64>,
        timestamp: f64,
    ) -> Vec<Signal> {
        let set = &self.indicators;
        let price = match set.price {
            Some(price) => price,
            None => return Vec::new(),
        };

        let mut signals = Vec::new();

        match self.mode {
            SubStrategyMode::A => {
                if let (Some(sma), Some(ema), Some(rsi)) = (set.sma, set.ema, set.rsi) {
                    if ema > sma && rsi < 40.0 {
                        signals.push(
                            Signal::new(
                                Direction::Long,
                                SignalKind::Entry,
                                self.timeframe,
                                price,
                                timestamp,
                            )
                            .with_condition("rsi", rsi)
                            .with_condition("ema", ema)
                            .with_condition("sma", sma),
                        );
                    } else if ema < sma || rsi > 80.0 {
                        signals.push(
                            Signal::new(
                                Direction::Long,
                                SignalKind::Exit,
                                self.timeframe,
                                price,
                                timestamp,
                            )
                            .with_condition("rsi", rsi),
                        );
                    }
                }
            }
            SubStrategyMode::B => {
                if let (Some(bb), Some(rsi)) = (set.bollinger.as_ref(), set.rsi) {
                    if price < bb.lower && rsi < 30.0 {
                        signals.push(
                            Signal::new(
                                Direction::Long,
                                SignalKind::Entry,
                                self.timeframe,
                                price,
                                timestamp,
                            )
                            .with_condition("rsi", rsi)
                            .with_condition("bb-lower", bb.lower),
                        );
                    } else if price > bb.upper {
                        signals.push(
                            Signal::new(
                                Direction::Long,
                                SignalKind::Exit,
                                self.timeframe,
                                price,
                                timestamp,
                            )
                            .with_condition("bb-upper", bb.upper),
                        );
                    }
                }
            }
            SubStrategyMode::C => {
                if let (Some(prev_close), Some(r1), Some(s1)) = (prev_close, prev_r1, prev_s1) {
                    if prev_close <= r1 && price > r1 {
                        let mut signal = Signal::new(
                            Direction::Long,
                            SignalKind::Entry,
                            self.timeframe,
                            price,
                            timestamp,
                        )
                        .with_condition("r1", r1);
                        // The breakout invalidates below the pivot itself.
                        signal.stop_loss = set.pivot.as_ref().map(|p| p.pivot);
                        signals.push(signal);
                    } else if prev_close >= s1 && price < s1 {
                        signals.push(
                            Signal::new(
                                Direction::Long,
                                SignalKind::Exit,
                                self.timeframe,
                                price,
                                timestamp,
                            )
                            .with_condition("s1", s1),
                        );
                    }
                }
            }
        }

        signals
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::pivot::PivotResult;

    fn set_with(price: f64) -> IndicatorSet {
        let mut set = IndicatorSet::new(Timeframe::T15M, IndicatorParams::default());
        set.price = Some(price);
        set
    }

    fn analyser_with(mode: SubStrategyMode, set: IndicatorSet) -> TimeframeAnalyser {
        let mut analyser =
            TimeframeAnalyser::new(Timeframe::T15M, mode, IndicatorParams::default());
        analyser.indicators = set;
        analyser
    }

    #[test]
    fn mode_a_entry_on_pullback_in_uptrend() {
        let mut set = set_with(100.0);
        set.sma = Some(98.0);
        set.ema = Some(99.0);
        set.rsi = Some(35.0);

        let analyser = analyser_with(SubStrategyMode::A, set);
        let signals = analyser.evaluate(None, None, None, 0.0);
        assert_eq!(signals.len(), 1);
        assert!(signals[0].is_entry());
        assert_eq!(signals[0].timeframe, Timeframe::T15M);
    }

    #[test]
    fn mode_a_exit_on_cross_down() {
        let mut set = set_with(100.0);
        set.sma = Some(101.0);
        set.ema = Some(100.0);
        set.rsi = Some(50.0);

        let analyser = analyser_with(SubStrategyMode::A, set);
        let signals = analyser.evaluate(None, None, None, 0.0);
        assert_eq!(signals.len(), 1);
        assert!(signals[0].is_exit());
    }

    #[test]
    fn mode_a_quiet_when_unaligned() {
        let mut set = set_with(100.0);
        set.sma = Some(98.0);
        set.ema = Some(99.0);
        set.rsi = Some(55.0); // no pullback, no stretch
        let analyser = analyser_with(SubStrategyMode::A, set);
        assert!(analyser.evaluate(None, None, None, 0.0).is_empty());
    }

    #[test]
    fn mode_b_entry_below_lower_band() {
        let mut set = set_with(95.0);
        set.rsi = Some(25.0);
        set.bollinger = Some(crate::indicators::bollinger::BollingerBands {
            upper: 105.0,
            middle: 100.0,
            lower: 96.0,
            width: 9.0,
        });

        let analyser = analyser_with(SubStrategyMode::B, set);
        let signals = analyser.evaluate(None, None, None, 0.0);
        assert_eq!(signals.len(), 1);
        assert!(signals[0].is_entry());
    }

    #[test]
    fn mode_c_breakout_sets_pivot_stop() {
        let mut set = set_with(111.0);
        set.pivot = Some(PivotResult {
            pivot: 100.0,
            resistances: [110.0, 120.0, 130.0],
            supports: [90.0, 80.0, 70.0],
        });

        let analyser = analyser_with(SubStrategyMode::C, set);
        // Previous close below the previous R1, current close above it.
        let signals = analyser.evaluate(Some(109.0), Some(110.0), Some(90.0), 0.0);
        assert_eq!(signals.len(), 1);
        assert!(signals[0].is_entry());
        assert_eq!(signals[0].stop_loss, Some(100.0));
    }

    #[test]
    fn major_trend_signs() {
        let mut set = set_with(100.0);
        set.sma = Some(98.0);
        set.ema = Some(99.0);
        set.sma55 = Some(97.0);
        set.rsi = Some(60.0);
        assert_eq!(major_trend(&set), 1);

        set.ema = Some(97.0);
        assert_eq!(major_trend(&set), -1);

        // Any missing input collapses the estimate to 0.
        set.rsi = None;
        assert_eq!(major_trend(&set), 0);
    }
}
