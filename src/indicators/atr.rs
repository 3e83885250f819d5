// =============================================================================
// Average True Range
// =============================================================================
//
// Volatility of a bar sequence, Wilder-smoothed. The true range of a bar
// widens past plain high-low whenever the bar gaps away from the previous
// close, which matters on thin markets where the tick stream pauses across
// bar boundaries. The strategy trader turns this reading into protective
// stop distances.

use crate::bars::Bar;

/// True range of one bar against the close that preceded it.
fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// Wilder-smoothed average true range over `bars` (oldest first).
///
/// The first `period` true ranges seed the average; every later one folds
/// in with weight `1/period`. Needs `period + 1` bars because each true
/// range consumes the previous close. Returns `None` on a zero period, a
/// short window, or any non-finite bar.
pub fn average_true_range(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() <= period {
        return None;
    }

    let p = period as f64;
    let mut atr = 0.0;
    let mut prev_close = bars[0].close;

    for (count, bar) in bars[1..].iter().enumerate() {
        let range = true_range(bar, prev_close);
        if !range.is_finite() {
            return None;
        }

        if count < period {
            atr += range / p;
        } else {
            atr += (range - atr) / p;
        }

        prev_close = bar.close;
    }

    atr.is_finite().then_some(atr)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: 0.0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    /// A run of bars sharing the same range, closing mid-bar.
    fn steady(range: f64, count: usize) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let mid = 50.0 + i as f64 * 0.01;
                bar(mid + range / 2.0, mid - range / 2.0, mid)
            })
            .collect()
    }

    #[test]
    fn rejects_zero_period() {
        assert!(average_true_range(&steady(4.0, 12), 0).is_none());
    }

    #[test]
    fn needs_one_bar_more_than_the_period() {
        let bars = steady(4.0, 6);
        assert!(average_true_range(&bars[..5], 5).is_none());
        assert!(average_true_range(&bars, 5).is_some());
    }

    #[test]
    fn steady_bars_settle_on_their_range() {
        // every true range is 4, so seeding and smoothing both read 4
        let atr = average_true_range(&steady(4.0, 40), 14).unwrap();
        assert!((atr - 4.0).abs() < 1e-9, "got {atr}");
    }

    #[test]
    fn gap_from_previous_close_widens_the_range() {
        // second bar spans only 2 points but sits 10 above the prior close
        let bars = vec![
            bar(51.0, 49.0, 50.0),
            bar(61.0, 59.0, 60.0),
            bar(61.5, 59.5, 60.5),
            bar(62.0, 60.0, 61.0),
        ];
        let atr = average_true_range(&bars, 3).unwrap();
        assert!(atr > 2.0, "gap should lift the average, got {atr}");
        // first true range is |61 - 50| = 11, averaged over three ranges
        assert!(atr < 11.0);
    }

    #[test]
    fn quiet_tail_decays_the_average() {
        let mut bars = steady(6.0, 20);
        // ten dead bars, e.g. synthesized over a tick gap: range zero
        let last_close = bars[bars.len() - 1].close;
        for _ in 0..10 {
            bars.push(bar(last_close, last_close, last_close));
        }

        let before = average_true_range(&bars[..20], 5).unwrap();
        let after = average_true_range(&bars, 5).unwrap();
        assert!(after < before, "dead bars must pull the reading down");
        assert!(after > 0.0);
    }

    #[test]
    fn non_finite_bar_poisons_the_result() {
        let mut bars = steady(4.0, 10);
        bars[4].low = f64::NAN;
        assert!(average_true_range(&bars, 5).is_none());
    }
}
