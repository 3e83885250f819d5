// =============================================================================
// Trade state machine — shared accounting record and the variant union
// =============================================================================
//
// A trade is one entry intent plus its outcome: a single entry order, zero
// or more child exit orders (at most one stop and one limit alive at a
// time), and the accounting that follows the fills. Entry and exit each
// walk their own state variable; fills are applied from normalized broker
// events, preferring cumulative quantities and broker-authoritative average
// prices.
//
// There is no inheritance across the three position models; `Trade` is a
// tagged union whose variants implement the same operation set over the
// shared `TradeCore` record.

pub mod asset;
pub mod ind_margin;
pub mod margin;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::broker::{Broker, BrokerSignal, OrderEvent, OrderTradedData, OrderType, PositionEvent};
use crate::timeframe::Timeframe;
use crate::types::Direction;

pub use asset::AssetTrade;
pub use ind_margin::IndMarginTrade;
pub use margin::MarginTrade;

/// Tolerance for exchange quantity rounding: some venues report a filled
/// quantity slightly above the ordered one.
pub const QTY_EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradeState {
    New,
    Rejected,
    Deleted,
    Canceled,
    Opened,
    PartiallyFilled,
    Filled,
}

/// Position model of the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeKind {
    Asset,
    Margin,
    IndMargin,
}

impl TradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Margin => "margin",
            Self::IndMargin => "ind-margin",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "asset" => Some(Self::Asset),
            "margin" => Some(Self::Margin),
            "ind-margin" => Some(Self::IndMargin),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics and operations
// ---------------------------------------------------------------------------

/// Fixed-size per-trade statistics record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TradeStats {
    pub best_price: f64,
    pub best_timestamp: f64,
    pub worst_price: f64,
    pub worst_timestamp: f64,
    pub entry_maker: bool,
    pub exit_maker: bool,
    pub entry_fees: f64,
    pub exit_fees: f64,
    #[serde(default)]
    pub conditions: BTreeMap<String, f64>,
}

/// A pending semi-automated adjustment attached to a user trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TradeOperation {
    pub id: u32,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub done: bool,
}

impl TradeOperation {
    pub fn can_delete(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// TradeCore — accounting shared by all variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TradeCore {
    pub id: i64,
    pub kind: TradeKind,
    pub entry_state: TradeState,
    pub exit_state: TradeState,
    /// Timeframe of the signal that created this trade.
    pub timeframe: Timeframe,
    pub direction: Direction,

    /// Ordered (limit) price.
    pub op: f64,
    /// Ordered quantity.
    pub oq: f64,
    /// Take-profit price (0.0 when unset).
    pub tp: f64,
    /// Stop-loss price (0.0 when unset).
    pub sl: f64,
    /// Quantity-weighted average entry price.
    pub aep: f64,
    /// Quantity-weighted average exit price.
    pub axp: f64,
    /// Entry order opened timestamp.
    pub eot: f64,
    /// Exit order opened timestamp.
    pub xot: f64,
    /// Cumulative filled entry quantity.
    pub e: f64,
    /// Cumulative filled exit quantity.
    pub x: f64,
    /// Profit/loss rate over the average entry cost.
    pub pl: f64,

    /// True when the user owns TP/SL adjustments.
    pub user_trade: bool,
    operations: Vec<TradeOperation>,
    next_operation_id: u32,

    pub stats: TradeStats,
}

impl TradeCore {
    pub fn new(kind: TradeKind, timeframe: Timeframe) -> Self {
        Self {
            id: 0,
            kind,
            entry_state: TradeState::New,
            exit_state: TradeState::New,
            timeframe,
            direction: Direction::Long,
            op: 0.0,
            oq: 0.0,
            tp: 0.0,
            sl: 0.0,
            aep: 0.0,
            axp: 0.0,
            eot: 0.0,
            xot: 0.0,
            e: 0.0,
            x: 0.0,
            pl: 0.0,
            user_trade: false,
            operations: Vec::new(),
            next_operation_id: 1,
            stats: TradeStats::default(),
        }
    }

    pub fn close_direction(&self) -> Direction {
        self.direction.opposite()
    }

    // -------------------------------------------------------------------------
    // Predicates
    // -------------------------------------------------------------------------

    /// The trade has entered quantity and its exit is not complete.
    pub fn is_active(&self) -> bool {
        if self.exit_state == TradeState::Filled {
            return false;
        }
        self.e > 0.0 && self.x < self.e
    }

    /// Entry order created, nothing filled yet.
    pub fn is_opened(&self) -> bool {
        self.entry_state == TradeState::Opened
    }

    /// Entry order in progress.
    pub fn is_opening(&self) -> bool {
        matches!(
            self.entry_state,
            TradeState::Opened | TradeState::PartiallyFilled
        )
    }

    /// Exit order in progress.
    pub fn is_closing(&self) -> bool {
        matches!(
            self.exit_state,
            TradeState::Opened | TradeState::PartiallyFilled
        )
    }

    /// All entered quantity has been exited.
    pub fn is_closed(&self) -> bool {
        self.exit_state == TradeState::Filled && self.x >= self.e - QTY_EPSILON
    }

    /// Rejected, or canceled without any fill.
    pub fn is_canceled(&self) -> bool {
        if self.entry_state == TradeState::Rejected {
            return true;
        }
        if self.entry_state == TradeState::Canceled && self.e <= 0.0 {
            return true;
        }
        if self.exit_state == TradeState::Canceled && self.x <= 0.0 {
            return true;
        }
        false
    }

    /// Entry opened but unfilled for at least `timeout` seconds.
    ///
    /// `eot` must be valid, otherwise the trade would time out immediately.
    pub fn is_entry_timeout(&self, timestamp: f64, timeout: f64) -> bool {
        self.entry_state == TradeState::Opened
            && self.e == 0.0
            && self.eot > 0.0
            && (timestamp - self.eot) >= timeout
    }

    /// The signal is still acceptable and the entry not fully filled.
    pub fn is_valid(&self, timestamp: f64, validity: f64) -> bool {
        self.is_opening() && self.e < self.oq && (timestamp - self.eot) <= validity
    }

    /// Deletion is only safe once every entered quantity is executed on the
    /// exit side (slippage can otherwise leave dust behind).
    pub fn can_delete(&self) -> bool {
        if self.entry_state == TradeState::Filled && self.exit_state == TradeState::Filled {
            return true;
        }

        if self.e >= self.oq && (self.x >= self.e || self.x >= self.oq) {
            // quantities alone say the trade is done, even if a state was
            // missed; overfilled entries compare against the ordered qty
            return true;
        }

        if self.e > 0.0 && self.x < self.e {
            return false;
        }

        if matches!(self.entry_state, TradeState::New | TradeState::Opened) {
            return false;
        }

        if self.e > 0.0 && matches!(self.exit_state, TradeState::New | TradeState::Opened) {
            return false;
        }

        true
    }

    /// Display state of the trade.
    pub fn state_to_str(&self) -> &'static str {
        if self.entry_state == TradeState::New {
            "new"
        } else if self.entry_state == TradeState::Opened {
            "opened"
        } else if self.entry_state == TradeState::Rejected {
            "rejected"
        } else if self.exit_state == TradeState::Rejected && self.e > self.x {
            // exit rejected while quantity remains: operator attention needed
            "problem"
        } else if self.e < self.oq
            && matches!(
                self.entry_state,
                TradeState::PartiallyFilled | TradeState::Opened
            )
        {
            "filling"
        } else if self.e > 0.0
            && self.x < self.e
            && matches!(
                self.exit_state,
                TradeState::PartiallyFilled | TradeState::Opened
            )
        {
            "closing"
        } else if (self.e > 0.0 && self.x >= self.e)
            || (self.entry_state == TradeState::Filled && self.exit_state == TradeState::Filled)
        {
            "closed"
        } else if self.e >= self.oq {
            "filled"
        } else if self.entry_state == TradeState::Canceled && self.e <= 0.0 {
            "canceled"
        } else {
            "waiting"
        }
    }

    // -------------------------------------------------------------------------
    // Fill accounting
    // -------------------------------------------------------------------------

    /// Apply an entry execution. Returns true when the entry just reached
    /// the fully-filled state.
    ///
    /// Cumulative quantities are preferred when present (precision comes
    /// from the broker); the broker's average price overrides the local
    /// weighted average; a bare fill without any price falls back to the
    /// ordered price.
    pub fn apply_entry_fill(&mut self, data: &OrderTradedData) -> bool {
        let filled = match data.cumulative_filled {
            Some(cumulative) if cumulative > 0.0 => cumulative - self.e,
            _ => data.filled.filter(|f| *f > 0.0).unwrap_or(0.0),
        };

        if let Some(avg) = data.avg_price.filter(|p| *p > 0.0) {
            self.aep = avg;
        } else if let Some(exec) = data.exec_price.filter(|p| *p > 0.0) {
            if self.e + filled > 0.0 {
                self.aep = ((self.aep * self.e) + (exec * filled)) / (self.e + filled);
            }
        } else {
            self.aep = self.op;
        }

        match data.cumulative_filled {
            Some(cumulative) => self.e = cumulative,
            None => self.e += filled,
        }

        if self.e >= self.oq - QTY_EPSILON && self.oq > 0.0 {
            let was_filled = self.entry_state == TradeState::Filled;
            self.entry_state = TradeState::Filled;
            !was_filled
        } else {
            self.entry_state = TradeState::PartiallyFilled;
            false
        }
    }

    /// Apply an exit execution (stop child, limit child or market close).
    /// Returns true when the exit just reached the fully-filled state.
    ///
    /// P/L keeps the entry notional in the denominator: it is a return on
    /// the average entry cost.
    pub fn apply_exit_fill(&mut self, data: &OrderTradedData) -> bool {
        let filled = match data.cumulative_filled {
            Some(cumulative) if cumulative > 0.0 => cumulative - self.x,
            _ => data.filled.filter(|f| *f > 0.0).unwrap_or(0.0),
        };

        if let Some(avg) = data.avg_price.filter(|p| *p > 0.0) {
            if self.aep > 0.0 {
                self.pl = self.direction.factor() * (avg - self.aep) / self.aep;
            }
            self.axp = avg;
        } else if let Some(exec) = data.exec_price.filter(|p| *p > 0.0) {
            if self.aep > 0.0 && self.e > 0.0 {
                self.pl += self.direction.factor() * ((exec * filled) - (self.aep * self.e))
                    / (self.aep * self.e);
            }
            if self.x + filled > 0.0 {
                self.axp = ((self.axp * self.x) + (exec * filled)) / (self.x + filled);
            }
        }

        match data.cumulative_filled {
            Some(cumulative) => self.x = cumulative,
            None => self.x += filled,
        }

        if self.x > self.e + QTY_EPSILON {
            warn!(
                trade_id = self.id,
                e = self.e,
                x = self.x,
                "problem: exit quantity exceeds entry quantity"
            );
        }

        if self.e > 0.0 && self.x >= self.e - QTY_EPSILON {
            let was_filled = self.exit_state == TradeState::Filled;
            self.exit_state = TradeState::Filled;
            !was_filled
        } else {
            self.exit_state = TradeState::PartiallyFilled;
            false
        }
    }

    /// The position is gone: fill whatever exit quantity remains at the
    /// supplied execution price so the accounting converges, then mark the
    /// exit filled.
    pub fn apply_position_deleted(&mut self, exec_price: Option<f64>) {
        if self.x < self.e {
            let filled = self.e - self.x;

            if let Some(exec) = exec_price.filter(|p| *p > 0.0) {
                if self.aep > 0.0 && self.e > 0.0 {
                    self.pl += self.direction.factor() * ((exec * filled) - (self.aep * self.e))
                        / (self.aep * self.e);
                }
                if self.x + filled > 0.0 {
                    self.axp = ((self.axp * self.x) + (exec * filled)) / (self.x + filled);
                }
            }

            self.x = self.e;
        }

        self.exit_state = TradeState::Filled;
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Track the best and worst price seen while the trade is active.
    pub fn update_stats(&mut self, last_price: f64, timestamp: f64) {
        if !self.is_active() {
            return;
        }

        match self.direction {
            Direction::Long => {
                if last_price > self.stats.best_price {
                    self.stats.best_price = last_price;
                    self.stats.best_timestamp = timestamp;
                }
                if last_price < self.stats.worst_price || self.stats.worst_price == 0.0 {
                    self.stats.worst_price = last_price;
                    self.stats.worst_timestamp = timestamp;
                }
            }
            Direction::Short => {
                if last_price < self.stats.best_price || self.stats.best_price == 0.0 {
                    self.stats.best_price = last_price;
                    self.stats.best_timestamp = timestamp;
                }
                if last_price > self.stats.worst_price {
                    self.stats.worst_price = last_price;
                    self.stats.worst_timestamp = timestamp;
                }
            }
        }
    }

    pub fn add_condition(&mut self, name: &str, value: f64) {
        self.stats.conditions.insert(name.to_string(), value);
    }

    // -------------------------------------------------------------------------
    // Operations (semi-automated trading)
    // -------------------------------------------------------------------------

    pub fn operations(&self) -> &[TradeOperation] {
        &self.operations
    }

    pub fn add_operation(&mut self, mut operation: TradeOperation) -> u32 {
        operation.id = self.next_operation_id;
        self.next_operation_id += 1;
        let id = operation.id;
        self.operations.push(operation);
        id
    }

    pub fn remove_operation(&mut self, operation_id: u32) -> bool {
        let before = self.operations.len();
        self.operations.retain(|op| op.id != operation_id);
        self.operations.len() != before
    }

    /// Drop finished operations, keeping the pending ones.
    pub fn cleanup_operations(&mut self) {
        self.operations.retain(|op| !op.can_delete());
    }

    pub fn has_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn clear_operations(&mut self) {
        self.operations.clear();
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Serialize the shared fields. Variants extend the map with their
    /// order/position ids.
    pub fn dumps(&self) -> Value {
        json!({
            "version": "1.0.0",
            "id": self.id,
            "type": self.kind.as_str(),
            "entry-state": self.entry_state,
            "exit-state": self.exit_state,
            "timeframe": self.timeframe,
            "user-trade": self.user_trade,
            "direction": self.direction,
            "order-price": self.op,
            "order-qty": self.oq,
            "take-profit-price": self.tp,
            "stop-loss-price": self.sl,
            "avg-entry-price": self.aep,
            "avg-exit-price": self.axp,
            "entry-open-time": self.eot,
            "exit-open-time": self.xot,
            "filled-entry-qty": self.e,
            "filled-exit-qty": self.x,
            "profit-loss-rate": self.pl,
            "statistics": serde_json::to_value(&self.stats).unwrap_or(Value::Null),
            "operations": serde_json::to_value(&self.operations).unwrap_or(Value::Null),
        })
    }

    /// Restore the shared fields. Returns false on a malformed snapshot.
    pub fn loads(&mut self, data: &Value) -> bool {
        let kind = match data
            .get("type")
            .and_then(Value::as_str)
            .and_then(TradeKind::from_str)
        {
            Some(kind) => kind,
            None => return false,
        };
        self.kind = kind;

        self.id = data.get("id").and_then(Value::as_i64).unwrap_or(-1);

        self.entry_state = parse_state(data.get("entry-state")).unwrap_or(TradeState::New);
        self.exit_state = parse_state(data.get("exit-state")).unwrap_or(TradeState::New);

        self.timeframe = data
            .get("timeframe")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        self.user_trade = data
            .get("user-trade")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.direction = data
            .get("direction")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(Direction::Long);

        self.op = get_f64(data, "order-price");
        self.oq = get_f64(data, "order-qty");
        self.tp = get_f64(data, "take-profit-price");
        self.sl = get_f64(data, "stop-loss-price");
        self.aep = get_f64(data, "avg-entry-price");
        self.axp = get_f64(data, "avg-exit-price");
        self.eot = get_f64(data, "entry-open-time");
        self.xot = get_f64(data, "exit-open-time");
        self.e = get_f64(data, "filled-entry-qty");
        self.x = get_f64(data, "filled-exit-qty");
        self.pl = get_f64(data, "profit-loss-rate");

        self.stats = data
            .get("statistics")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        self.operations = data
            .get("operations")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        self.next_operation_id = self.operations.iter().map(|op| op.id).max().unwrap_or(0) + 1;

        true
    }
}

fn parse_state(value: Option<&Value>) -> Option<TradeState> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn get_f64(data: &Value, key: &str) -> f64 {
    data.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Trade — the variant union
// ---------------------------------------------------------------------------

/// Parameters of an entry order, shared by the three `open` implementations.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub market_id: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub order_price: Option<f64>,
    pub quantity: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub leverage: f64,
}

/// One trade in one of the three position models.
#[derive(Debug, Clone)]
pub enum Trade {
    Asset(AssetTrade),
    Margin(MarginTrade),
    IndMargin(IndMarginTrade),
}

impl Trade {
    pub fn core(&self) -> &TradeCore {
        match self {
            Self::Asset(t) => &t.core,
            Self::Margin(t) => &t.core,
            Self::IndMargin(t) => &t.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut TradeCore {
        match self {
            Self::Asset(t) => &mut t.core,
            Self::Margin(t) => &mut t.core,
            Self::IndMargin(t) => &mut t.core,
        }
    }

    /// Order to open a position or to buy an asset.
    pub fn open(&mut self, broker: &dyn Broker, request: &OpenRequest) -> bool {
        match self {
            Self::Asset(t) => t.open(broker, request),
            Self::Margin(t) => t.open(broker, request),
            Self::IndMargin(t) => t.open(broker, request),
        }
    }

    /// Cancel the remaining orders without closing the position.
    pub fn remove(&mut self, broker: &dyn Broker) {
        match self {
            Self::Asset(t) => t.remove(broker),
            Self::Margin(t) => t.remove(broker),
            Self::IndMargin(t) => t.remove(broker),
        }
    }

    /// Cancel the entire or remaining entry order.
    pub fn cancel_open(&mut self, broker: &dyn Broker) -> bool {
        match self {
            Self::Asset(t) => t.cancel_open(broker),
            Self::Margin(t) => t.cancel_open(broker),
            Self::IndMargin(t) => t.cancel_open(broker),
        }
    }

    /// Cancel the remaining exit child orders.
    pub fn cancel_close(&mut self, broker: &dyn Broker) -> bool {
        match self {
            Self::Asset(t) => t.cancel_close(broker),
            Self::Margin(t) => t.cancel_close(broker),
            Self::IndMargin(t) => t.cancel_close(broker),
        }
    }

    pub fn modify_take_profit(&mut self, broker: &dyn Broker, market_id: &str, price: f64) -> bool {
        match self {
            Self::Asset(t) => t.modify_take_profit(broker, market_id, price),
            Self::Margin(t) => t.modify_take_profit(broker, market_id, price),
            Self::IndMargin(t) => t.modify_take_profit(broker, market_id, price),
        }
    }

    pub fn modify_stop_loss(&mut self, broker: &dyn Broker, market_id: &str, price: f64) -> bool {
        match self {
            Self::Asset(t) => t.modify_stop_loss(broker, market_id, price),
            Self::Margin(t) => t.modify_stop_loss(broker, market_id, price),
            Self::IndMargin(t) => t.modify_stop_loss(broker, market_id, price),
        }
    }

    /// Close the position or sell the remaining asset at market.
    pub fn close(&mut self, broker: &dyn Broker, market_id: &str) -> bool {
        match self {
            Self::Asset(t) => t.close(broker, market_id),
            Self::Margin(t) => t.close(broker, market_id),
            Self::IndMargin(t) => t.close(broker, market_id),
        }
    }

    pub fn order_signal(&mut self, event: &OrderEvent, ref_order_id: Option<&str>) {
        match self {
            Self::Asset(t) => t.order_signal(event, ref_order_id),
            Self::Margin(t) => t.order_signal(event, ref_order_id),
            Self::IndMargin(t) => t.order_signal(event, ref_order_id),
        }
    }

    pub fn position_signal(&mut self, event: &PositionEvent, ref_order_id: Option<&str>) {
        match self {
            Self::Asset(t) => t.position_signal(event, ref_order_id),
            Self::Margin(t) => t.position_signal(event, ref_order_id),
            Self::IndMargin(t) => t.position_signal(event, ref_order_id),
        }
    }

    pub fn is_target_order(&self, order_id: Option<&str>, ref_order_id: Option<&str>) -> bool {
        match self {
            Self::Asset(t) => t.is_target_order(order_id, ref_order_id),
            Self::Margin(t) => t.is_target_order(order_id, ref_order_id),
            Self::IndMargin(t) => t.is_target_order(order_id, ref_order_id),
        }
    }

    pub fn is_target_position(
        &self,
        position_id: Option<&str>,
        ref_order_id: Option<&str>,
    ) -> bool {
        match self {
            Self::Asset(t) => t.is_target_position(position_id, ref_order_id),
            Self::Margin(t) => t.is_target_position(position_id, ref_order_id),
            Self::IndMargin(t) => t.is_target_position(position_id, ref_order_id),
        }
    }

    /// Variant-aware closing check: pending child reference ids count too.
    pub fn is_closing(&self) -> bool {
        match self {
            Self::Asset(t) => t.is_closing(),
            Self::Margin(t) => t.is_closing(),
            Self::IndMargin(t) => t.is_closing(),
        }
    }

    /// Quantity resting on the live stop child, 0.0 when absent.
    pub fn stop_order_qty(&self) -> f64 {
        match self {
            Self::Asset(t) => t.stop_order_qty,
            Self::Margin(t) => t.stop_order_qty,
            Self::IndMargin(t) => t.stop_order_qty,
        }
    }

    /// Quantity resting on the live limit child, 0.0 when absent.
    pub fn limit_order_qty(&self) -> f64 {
        match self {
            Self::Asset(t) => t.limit_order_qty,
            Self::Margin(t) => t.limit_order_qty,
            Self::IndMargin(t) => t.limit_order_qty,
        }
    }

    pub fn dumps(&self) -> Value {
        match self {
            Self::Asset(t) => t.dumps(),
            Self::Margin(t) => t.dumps(),
            Self::IndMargin(t) => t.dumps(),
        }
    }

    /// Rebuild a trade of the right variant from a snapshot.
    pub fn from_dump(data: &Value) -> Option<Self> {
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .and_then(TradeKind::from_str)?;

        let mut trade = match kind {
            TradeKind::Asset => Self::Asset(AssetTrade::new(Timeframe::default())),
            TradeKind::Margin => Self::Margin(MarginTrade::new(Timeframe::default())),
            TradeKind::IndMargin => Self::IndMargin(IndMarginTrade::new(Timeframe::default())),
        };

        let ok = match &mut trade {
            Self::Asset(t) => t.loads(data),
            Self::Margin(t) => t.loads(data),
            Self::IndMargin(t) => t.loads(data),
        };

        if ok {
            Some(trade)
        } else {
            None
        }
    }

    /// Dispatch a queued broker signal to this trade.
    pub fn dispatch(&mut self, signal: &BrokerSignal) {
        match signal {
            BrokerSignal::Order {
                event,
                ref_order_id,
            } => self.order_signal(event, ref_order_id.as_deref()),
            BrokerSignal::Position {
                event,
                ref_order_id,
            } => self.position_signal(event, ref_order_id.as_deref()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests — invariants, idempotence, accounting ordering
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn traded(
        cumulative: Option<f64>,
        filled: Option<f64>,
        avg: Option<f64>,
        exec: Option<f64>,
    ) -> OrderTradedData {
        OrderTradedData {
            id: "oid".into(),
            filled,
            cumulative_filled: cumulative,
            avg_price: avg,
            exec_price: exec,
        }
    }

    fn core_with_order(oq: f64, op: f64) -> TradeCore {
        let mut core = TradeCore::new(TradeKind::IndMargin, Timeframe::T15M);
        core.oq = oq;
        core.op = op;
        core.entry_state = TradeState::Opened;
        core
    }

    #[test]
    fn entry_fill_prefers_cumulative_and_avg() {
        let mut core = core_with_order(10.0, 100.0);
        let done = core.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));
        assert!(done);
        assert_eq!(core.e, 10.0);
        assert_eq!(core.aep, 100.0);
        assert_eq!(core.entry_state, TradeState::Filled);
    }

    #[test]
    fn entry_fill_weighted_average_from_exec_price() {
        let mut core = core_with_order(10.0, 100.0);
        core.apply_entry_fill(&traded(None, Some(4.0), None, Some(100.0)));
        core.apply_entry_fill(&traded(None, Some(6.0), None, Some(110.0)));
        assert_eq!(core.e, 10.0);
        // (100*4 + 110*6) / 10 = 106
        assert!((core.aep - 106.0).abs() < 1e-9);
        assert_eq!(core.entry_state, TradeState::Filled);
    }

    #[test]
    fn entry_fill_without_price_uses_order_price() {
        let mut core = core_with_order(10.0, 101.0);
        core.apply_entry_fill(&traded(Some(3.0), None, None, None));
        assert_eq!(core.aep, 101.0);
        assert_eq!(core.entry_state, TradeState::PartiallyFilled);
    }

    #[test]
    fn entry_overfill_rounding_is_tolerated() {
        // oq=10, single fill cum=10.0001: filled, no error.
        let mut core = core_with_order(10.0, 100.0);
        core.apply_entry_fill(&traded(Some(10.0001), None, Some(100.0), None));
        assert_eq!(core.entry_state, TradeState::Filled);
        assert!((core.e - 10.0001).abs() < 1e-12);
    }

    #[test]
    fn traded_event_replay_is_idempotent() {
        let mut core = core_with_order(10.0, 100.0);
        let event = traded(Some(6.0), None, Some(100.5), None);

        core.apply_entry_fill(&event);
        let (e1, aep1, state1) = (core.e, core.aep, core.entry_state);

        core.apply_entry_fill(&event);
        assert_eq!(core.e, e1);
        assert_eq!(core.aep, aep1);
        assert_eq!(core.entry_state, state1);
    }

    #[test]
    fn increasing_cumulative_fills_yield_weighted_average() {
        // Fills at strictly increasing cumulative quantities with per-step
        // exec prices: aep must equal the weighted average.
        let mut core = core_with_order(10.0, 100.0);
        let steps = [(2.0, 100.0), (5.0, 102.0), (10.0, 104.0)];
        let mut prev = 0.0;
        for (cum, exec) in steps {
            core.apply_entry_fill(&traded(Some(cum), None, None, Some(exec)));
            prev = cum;
        }
        assert_eq!(prev, 10.0);
        let expected = (2.0 * 100.0 + 3.0 * 102.0 + 5.0 * 104.0) / 10.0;
        assert!((core.aep - expected).abs() < 1e-9, "aep={} expected={expected}", core.aep);
    }

    #[test]
    fn exit_fill_avg_price_recomputes_pl() {
        // Scenario: entry filled at 100, exit at 110 => pl ~= +10%.
        let mut core = core_with_order(10.0, 100.0);
        core.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));
        let done = core.apply_exit_fill(&traded(Some(10.0), None, Some(110.0), None));
        assert!(done);
        assert_eq!(core.x, 10.0);
        assert_eq!(core.axp, 110.0);
        assert!((core.pl - 0.10).abs() < 1e-9);
        assert!(core.is_closed());
        assert!(!core.is_active());
    }

    #[test]
    fn exit_fill_short_direction_inverts_pl() {
        let mut core = core_with_order(10.0, 100.0);
        core.direction = Direction::Short;
        core.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));
        core.apply_exit_fill(&traded(Some(10.0), None, Some(110.0), None));
        assert!((core.pl + 0.10).abs() < 1e-9);
    }

    #[test]
    fn pl_sign_agrees_with_direction_and_prices() {
        let mut core = core_with_order(5.0, 50.0);
        core.apply_entry_fill(&traded(Some(5.0), None, Some(50.0), None));
        core.apply_exit_fill(&traded(Some(5.0), None, Some(48.0), None));
        assert!(core.x > 0.0);
        let expected_sign = core.direction.factor() * (core.axp - core.aep);
        assert!(core.pl * expected_sign > 0.0);
    }

    #[test]
    fn position_deleted_converges_accounting() {
        // Long, e=5 at aep=100, x=2 at 120, remainder filled at 120.
        let mut core = core_with_order(5.0, 100.0);
        core.apply_entry_fill(&traded(Some(5.0), None, Some(100.0), None));
        core.apply_exit_fill(&traded(Some(2.0), None, None, Some(120.0)));
        assert_eq!(core.exit_state, TradeState::PartiallyFilled);

        let pl_before = core.pl;
        core.apply_position_deleted(Some(120.0));

        assert_eq!(core.x, 5.0);
        assert_eq!(core.exit_state, TradeState::Filled);
        // Remaining 3 units at 120 moved the running P/L.
        let expected_delta = (120.0 * 3.0 - 100.0 * 5.0) / (100.0 * 5.0);
        assert!((core.pl - pl_before - expected_delta).abs() < 1e-9);
        assert!(core.is_closed());
    }

    #[test]
    fn quantity_invariant_holds_after_events() {
        let mut core = core_with_order(10.0, 100.0);
        core.apply_entry_fill(&traded(Some(4.0), None, Some(100.0), None));
        core.apply_exit_fill(&traded(Some(2.0), None, None, Some(101.0)));
        assert!(0.0 <= core.x);
        assert!(core.x <= core.e);
        assert!(core.e <= core.oq + QTY_EPSILON);
        assert!(core.is_active());
    }

    #[test]
    fn active_closed_canceled_predicates() {
        let mut core = core_with_order(10.0, 100.0);
        assert!(!core.is_active());

        core.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));
        assert!(core.is_active());
        assert!(!core.is_closed());

        core.apply_exit_fill(&traded(Some(10.0), None, Some(105.0), None));
        assert!(!core.is_active());
        assert!(core.is_closed());
        assert!(core.can_delete());

        let mut rejected = core_with_order(10.0, 100.0);
        rejected.entry_state = TradeState::Rejected;
        assert!(rejected.is_canceled());

        let mut canceled = core_with_order(10.0, 100.0);
        canceled.entry_state = TradeState::Canceled;
        assert!(canceled.is_canceled());
    }

    #[test]
    fn entry_timeout_and_validity() {
        let mut core = core_with_order(10.0, 100.0);
        core.eot = 1_000.0;

        // Opened, unfilled, timeframe elapsed.
        assert!(core.is_entry_timeout(1_000.0 + 900.0, 900.0));
        assert!(!core.is_entry_timeout(1_000.0 + 100.0, 900.0));

        // Partially filled entries never time out, they expire.
        core.apply_entry_fill(&traded(Some(3.0), None, Some(100.0), None));
        assert!(!core.is_entry_timeout(1_000.0 + 900.0, 900.0));
        assert!(core.is_valid(1_500.0, 3_600.0));
        assert!(!core.is_valid(1_000.0 + 3_700.0, 3_600.0));
    }

    #[test]
    fn state_strings() {
        let mut core = core_with_order(10.0, 100.0);
        core.entry_state = TradeState::New;
        assert_eq!(core.state_to_str(), "new");

        core.entry_state = TradeState::Opened;
        assert_eq!(core.state_to_str(), "opened");

        core.apply_entry_fill(&traded(Some(3.0), None, Some(100.0), None));
        assert_eq!(core.state_to_str(), "filling");

        core.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));
        assert_eq!(core.state_to_str(), "filled");

        core.exit_state = TradeState::Opened;
        assert_eq!(core.state_to_str(), "closing");

        core.apply_exit_fill(&traded(Some(10.0), None, Some(101.0), None));
        assert_eq!(core.state_to_str(), "closed");

        let mut problem = core_with_order(10.0, 100.0);
        problem.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));
        problem.exit_state = TradeState::Rejected;
        assert_eq!(problem.state_to_str(), "problem");
    }

    #[test]
    fn stats_track_best_and_worst() {
        let mut core = core_with_order(10.0, 100.0);
        core.apply_entry_fill(&traded(Some(10.0), None, Some(100.0), None));

        core.update_stats(105.0, 1.0);
        core.update_stats(95.0, 2.0);
        core.update_stats(110.0, 3.0);

        assert_eq!(core.stats.best_price, 110.0);
        assert_eq!(core.stats.best_timestamp, 3.0);
        assert_eq!(core.stats.worst_price, 95.0);
        assert_eq!(core.stats.worst_timestamp, 2.0);
    }

    #[test]
    fn operations_lifecycle() {
        let mut core = TradeCore::new(TradeKind::Asset, Timeframe::T1H);
        let id1 = core.add_operation(TradeOperation {
            id: 0,
            name: "step-stop".into(),
            price: 101.0,
            done: false,
        });
        let id2 = core.add_operation(TradeOperation {
            id: 0,
            name: "scale-out".into(),
            price: 105.0,
            done: true,
        });
        assert_eq!((id1, id2), (1, 2));
        assert!(core.has_operations());

        core.cleanup_operations();
        assert_eq!(core.operations().len(), 1);
        assert!(core.remove_operation(id1));
        assert!(!core.remove_operation(id1));
        assert!(!core.has_operations());
    }

    #[test]
    fn dumps_loads_roundtrip_core() {
        let mut core = core_with_order(10.0, 100.0);
        core.id = 42;
        core.tp = 120.0;
        core.sl = 95.0;
        core.apply_entry_fill(&traded(Some(10.0), None, Some(100.5), None));
        core.apply_exit_fill(&traded(Some(4.0), None, None, Some(111.0)));
        core.add_condition("rsi", 28.0);

        let dump = core.dumps();

        let mut restored = TradeCore::new(TradeKind::Asset, Timeframe::T1M);
        assert!(restored.loads(&dump));

        assert_eq!(restored.id, 42);
        assert_eq!(restored.kind, TradeKind::IndMargin);
        assert_eq!(restored.timeframe, Timeframe::T15M);
        assert_eq!(restored.entry_state, TradeState::Filled);
        assert_eq!(restored.exit_state, TradeState::PartiallyFilled);
        assert_eq!(restored.op, core.op);
        assert_eq!(restored.oq, core.oq);
        assert_eq!(restored.tp, core.tp);
        assert_eq!(restored.sl, core.sl);
        assert_eq!(restored.aep, core.aep);
        assert_eq!(restored.axp, core.axp);
        assert_eq!(restored.e, core.e);
        assert_eq!(restored.x, core.x);
        assert_eq!(restored.pl, core.pl);
        assert_eq!(restored.stats.conditions.get("rsi"), Some(&28.0));
    }

    #[test]
    fn loads_rejects_malformed_snapshot() {
        let mut core = TradeCore::new(TradeKind::Asset, Timeframe::T1M);
        assert!(!core.loads(&json!({ "type": "hedge-grid" })));
        assert!(!core.loads(&json!({})));
    }
}
