// =============================================================================
// Exponential Moving Average
// =============================================================================
//
// A mean that leans toward the newest values: each step pulls the running
// average a fixed fraction `2 / (period + 1)` of the way to the incoming
// value. Seeded with the plain mean of the leading window so the early
// readings are not dominated by the very first close.

/// Latest EMA over `values` (oldest first).
///
/// Returns `None` when the period is zero, when fewer than `period` values
/// are available, or when the inputs are not finite.
pub fn exponential_average(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let ema = values[period..]
        .iter()
        .fold(seed, |acc, &value| acc + alpha * (value - acc));

    ema.is_finite().then_some(ema)
}
