// =============================================================================
// Relative Strength Index
// =============================================================================
//
// Balance of recent up-moves against down-moves on a 0..100 scale, using
// Wilder's smoothing for both sides. Written here as `100 * up / (up + down)`,
// which is the textbook `100 - 100 / (1 + RS)` with the division by a zero
// loss average factored away.

/// Latest RSI over `closes` (oldest first).
///
/// The first `period` close-to-close moves seed the up/down averages, the
/// rest are Wilder-smoothed in place. Returns `None` when the period is
/// zero, when fewer than `period + 1` closes are available (one move needs
/// two closes), or when the inputs are not finite. A window with no
/// movement at all reads 50.
pub fn relative_strength_index(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }

    let p = period as f64;
    let mut up = 0.0;
    let mut down = 0.0;

    for pair in closes.windows(2).take(period) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            up += delta / p;
        } else {
            down -= delta / p;
        }
    }

    for pair in closes.windows(2).skip(period) {
        let delta = pair[1] - pair[0];
        up = (up * (p - 1.0) + delta.max(0.0)) / p;
        down = (down * (p - 1.0) + (-delta).max(0.0)) / p;
    }

    let index = if up + down == 0.0 {
        // flat window, neither side dominates
        50.0
    } else {
        100.0 * up / (up + down)
    };

    index.is_finite().then_some(index)
}
