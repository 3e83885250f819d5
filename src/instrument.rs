// =============================================================================
// Instrument — market metadata, externally owned and read-only to the core
// =============================================================================
//
// Carries the exchange constraints (tick/lot/notional), fee tiers, and the
// rolling 24h statistics the market filter consumes. The metadata service
// that keeps these fields fresh is an external collaborator.

use serde::{Deserialize, Serialize};

/// Position model of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketKind {
    /// Spot buy/sell of the base asset.
    Spot,
    /// Individual margin positions, hedging possible.
    Margin,
    /// A single aggregated position per market, no hedging.
    IndivisibleMargin,
}

impl Default for MarketKind {
    fn default() -> Self {
        Self::Spot
    }
}

/// Market metadata snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub market_id: String,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(default)]
    pub kind: MarketKind,

    /// Price increment.
    pub tick_size: f64,
    /// Quantity increment.
    pub step_size: f64,
    #[serde(default)]
    pub min_qty: f64,
    #[serde(default = "default_max_qty")]
    pub max_qty: f64,
    /// Exchange floor on `price * quantity` per order.
    #[serde(default)]
    pub min_notional: f64,

    pub maker_fee: f64,
    pub taker_fee: f64,

    /// Rolling 24h traded volume in quote currency.
    #[serde(default)]
    pub vol24h_quote: f64,
    /// Last traded price.
    #[serde(default)]
    pub last_price: f64,
    /// Current bid/ask spread in quote units.
    #[serde(default)]
    pub spread: f64,

    /// Whether plain buy/sell trading is enabled on this market.
    #[serde(default = "default_true")]
    pub buy_sell_enabled: bool,

    /// Quote-currency budget the strategy commits per entry order.
    #[serde(default)]
    pub trader_quantity: f64,
}

fn default_true() -> bool {
    true
}

fn default_max_qty() -> f64 {
    f64::MAX
}

impl Instrument {
    /// Clamp a quantity to the market limits and floor it to the lot step.
    ///
    /// Returns 0.0 when the adjusted quantity falls below the minimum.
    pub fn adjust_quantity(&self, quantity: f64) -> f64 {
        if quantity.is_nan() || quantity <= 0.0 {
            return 0.0;
        }

        let clamped = quantity.min(self.max_qty);

        let stepped = if self.step_size > 0.0 {
            (clamped / self.step_size).floor() * self.step_size
        } else {
            clamped
        };

        if stepped < self.min_qty {
            0.0
        } else {
            stepped
        }
    }

    /// Round a price down to the tick grid.
    pub fn adjust_price(&self, price: f64) -> f64 {
        if self.tick_size > 0.0 {
            (price / self.tick_size).floor() * self.tick_size
        } else {
            price
        }
    }

    /// Number of decimals implied by an increment (tick or step size).
    fn decimals(increment: f64) -> usize {
        if increment <= 0.0 {
            return 8;
        }
        let mut value = increment;
        let mut decimals = 0usize;
        while value.fract().abs() > 1e-9 && decimals < 12 {
            value *= 10.0;
            decimals += 1;
        }
        decimals
    }

    /// Format a price with the precision of the tick grid.
    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", Self::decimals(self.tick_size), price)
    }

    /// Format a quantity with the precision of the lot step.
    pub fn format_quantity(&self, quantity: f64) -> String {
        format!("{:.*}", Self::decimals(self.step_size), quantity)
    }
}
