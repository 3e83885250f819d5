// =============================================================================
// Pivot Points — classic floor-trader levels
// =============================================================================
//
// Computed from the last closed bar of the timeframe:
//   P  = (H + L + C) / 3
//   R1 = 2P - L        S1 = 2P - H
//   R2 = P + (H - L)   S2 = P - (H - L)
//   R3 = H + 2(P - L)  S3 = L - 2(H - P)
//
// The strategy trader consumes the resistances as profit targets on the
// take-profit timeframe.

use crate::bars::Bar;

/// Pivot level with its three resistances and supports, nearest first.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotResult {
    pub pivot: f64,
    pub resistances: [f64; 3],
    pub supports: [f64; 3],
}

/// Calculate the classic pivot levels from one closed bar.
///
/// Returns `None` when the bar carries a non-finite value or a degenerate
/// (inverted) range.
pub fn calculate_pivot(bar: &Bar) -> Option<PivotResult> {
    let (high, low, close) = (bar.high, bar.low, bar.close);

    if !high.is_finite() || !low.is_finite() || !close.is_finite() || high < low {
        return None;
    }

    let pivot = (high + low + close) / 3.0;
    let range = high - low;

    let r1 = 2.0 * pivot - low;
    let r2 = pivot + range;
    let r3 = high + 2.0 * (pivot - low);

    let s1 = 2.0 * pivot - high;
    let s2 = pivot - range;
    let s3 = low - 2.0 * (high - pivot);

    Some(PivotResult {
        pivot,
        resistances: [r1, r2, r3],
        supports: [s1, s2, s3],
    })
}
