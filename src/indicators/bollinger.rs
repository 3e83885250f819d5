// =============================================================================
// Bollinger Bands
// =============================================================================
//
// A dispersion envelope around the rolling mean: the bands sit
// `width_factor` population standard deviations either side of it. The
// relative width (band spread over the mean, in percent) doubles as a
// compact volatility reading.

/// Bands computed from the tail of a close series.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band spread relative to the middle, in percent.
    pub width: f64,
}

/// Bands over the last `period` closes with the given deviation factor.
///
/// Returns `None` when the period is zero, the window is short, the mean
/// is zero (the relative width would be meaningless), or the numbers are
/// not finite.
pub fn bollinger_bands(
    closes: &[f64],
    period: usize,
    width_factor: f64,
) -> Option<BollingerBands> {
    if period == 0 || period > closes.len() {
        return None;
    }

    let start = closes.len() - period;
    let window = &closes[start..];
    let n = period as f64;

    let middle = window.iter().sum::<f64>() / n;
    if middle == 0.0 {
        return None;
    }

    let dispersion = (window
        .iter()
        .map(|close| {
            let diff = close - middle;
            diff * diff
        })
        .sum::<f64>()
        / n)
        .sqrt();

    let band = width_factor * dispersion;
    let width = 2.0 * band / middle * 100.0;

    width.is_finite().then(|| BollingerBands {
        upper: middle + band,
        middle,
        lower: middle - band,
        width,
    })
}
