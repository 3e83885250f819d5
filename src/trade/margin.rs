// =============================================================================
// Margin trade — individual position, hedging-capable venues
// =============================================================================
//
// Each trade maps to its own position on the venue, so opposite-direction
// trades can coexist (hedging). Protective exits are plain stop and limit
// children on the position's quantity; a deleted position converges the
// trade exactly like the indivisible model.

use serde_json::Value;
use tracing::debug;

use crate::broker::{Broker, Order, OrderEvent, OrderType, PositionEvent};
use crate::timeframe::Timeframe;
use crate::trade::{OpenRequest, TradeCore, TradeKind, TradeState, QTY_EPSILON};

#[derive(Debug, Clone)]
pub struct MarginTrade {
    pub core: TradeCore,

    pub create_ref_oid: Option<String>,
    pub stop_ref_oid: Option<String>,
    pub limit_ref_oid: Option<String>,

    pub create_oid: Option<String>,
    pub stop_oid: Option<String>,
    pub limit_oid: Option<String>,

    pub position_id: Option<String>,

    pub leverage: f64,
    /// Whether opposite-direction positions may coexist on this market.
    pub hedging: bool,

    pub stop_order_qty: f64,
    pub limit_order_qty: f64,
}

impl MarginTrade {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            core: TradeCore::new(TradeKind::Margin, timeframe),
            create_ref_oid: None,
            stop_ref_oid: None,
            limit_ref_oid: None,
            create_oid: None,
            stop_oid: None,
            limit_oid: None,
            position_id: None,
            leverage: 1.0,
            hedging: false,
            stop_order_qty: 0.0,
            limit_order_qty: 0.0,
        }
    }

    pub fn open(&mut self, broker: &dyn Broker, request: &OpenRequest) -> bool {
        let mut order = Order::new(
            &request.market_id,
            request.direction,
            request.order_type,
            request.quantity,
        );
        order.price = request.order_price;
        order.leverage = request.leverage;

        broker.set_ref_order_id(&mut order);
        self.create_ref_oid = order.ref_order_id.clone();

        self.leverage = request.leverage;
        self.core.direction = request.direction;
        self.core.op = request.order_price.unwrap_or(0.0);
        self.core.oq = request.quantity;
        self.core.tp = request.take_profit.unwrap_or(0.0);
        self.core.sl = request.stop_loss.unwrap_or(0.0);

        self.core.stats.entry_maker = !order.is_market();

        if broker.create_order(&mut order) {
            self.position_id = order.position_id.clone();

            if self.core.eot == 0.0 && order.created_time > 0.0 {
                self.core.eot = order.created_time;
            }

            true
        } else {
            self.create_ref_oid = None;
            false
        }
    }

    pub fn remove(&mut self, broker: &dyn Broker) {
        if let Some(create_oid) = self.create_oid.clone() {
            if broker.cancel_order(&create_oid) {
                self.create_ref_oid = None;
                self.create_oid = None;
                self.core.entry_state = TradeState::Canceled;
            }
        }

        if let Some(stop_oid) = self.stop_oid.clone() {
            if broker.cancel_order(&stop_oid) {
                self.stop_ref_oid = None;
                self.stop_oid = None;
                self.stop_order_qty = 0.0;
            }
        }

        if let Some(limit_oid) = self.limit_oid.clone() {
            if broker.cancel_order(&limit_oid) {
                self.limit_ref_oid = None;
                self.limit_oid = None;
                self.limit_order_qty = 0.0;
            }
        }
    }

    pub fn cancel_open(&mut self, broker: &dyn Broker) -> bool {
        if let Some(create_oid) = self.create_oid.clone() {
            if broker.cancel_order(&create_oid) {
                self.create_ref_oid = None;
                self.create_oid = None;
                self.core.entry_state = TradeState::Canceled;
            } else {
                return false;
            }
        }

        true
    }

    /// Cancel the remaining exit children (stop and limit).
    pub fn cancel_close(&mut self, broker: &dyn Broker) -> bool {
        if let Some(stop_oid) = self.stop_oid.clone() {
            if broker.cancel_order(&stop_oid) {
                self.stop_ref_oid = None;
                self.stop_oid = None;
                self.stop_order_qty = 0.0;
            } else {
                return false;
            }
        }

        if let Some(limit_oid) = self.limit_oid.clone() {
            if broker.cancel_order(&limit_oid) {
                self.limit_ref_oid = None;
                self.limit_oid = None;
                self.limit_order_qty = 0.0;
            } else {
                return false;
            }
        }

        true
    }

    pub fn modify_take_profit(&mut self, broker: &dyn Broker, market_id: &str, price: f64) -> bool {
        if let Some(limit_oid) = self.limit_oid.clone() {
            if broker.cancel_order(&limit_oid) {
                self.limit_ref_oid = None;
                self.limit_oid = None;
                self.limit_order_qty = 0.0;
            } else {
                return false;
            }
        }

        if (self.core.e - self.core.x).abs() <= QTY_EPSILON {
            return true;
        }

        if self.core.e < self.core.x {
            return false;
        }

        if self.core.e > 0.0 {
            let mut order = Order::new(
                market_id,
                self.core.close_direction(),
                OrderType::TakeProfitLimit,
                self.core.e - self.core.x,
            );
            order.price = Some(price);
            order.leverage = self.leverage;

            broker.set_ref_order_id(&mut order);
            self.limit_ref_oid = order.ref_order_id.clone();

            self.core.stats.exit_maker = !order.is_market();

            if broker.create_order(&mut order) {
                self.limit_oid = order.order_id.clone();
                self.limit_order_qty = order.quantity;
                self.core.tp = price;
                return true;
            } else {
                self.limit_ref_oid = None;
                self.limit_order_qty = 0.0;
            }
        }

        false
    }

    pub fn modify_stop_loss(&mut self, broker: &dyn Broker, market_id: &str, price: f64) -> bool {
        if let Some(stop_oid) = self.stop_oid.clone() {
            if broker.cancel_order(&stop_oid) {
                self.stop_ref_oid = None;
                self.stop_oid = None;
                self.stop_order_qty = 0.0;
            } else {
                return false;
            }
        }

        if (self.core.e - self.core.x).abs() <= QTY_EPSILON {
            return true;
        }

        if self.core.e < self.core.x {
            return false;
        }

        if self.core.e > 0.0 {
            let mut order = Order::new(
                market_id,
                self.core.close_direction(),
                OrderType::Stop,
                self.core.e - self.core.x,
            );
            order.price = Some(price);
            order.leverage = self.leverage;

            broker.set_ref_order_id(&mut order);
            self.stop_ref_oid = order.ref_order_id.clone();

            self.core.stats.exit_maker = !order.is_market();

            if broker.create_order(&mut order) {
                self.stop_oid = order.order_id.clone();
                self.stop_order_qty = order.quantity;
                self.core.sl = price;
                return true;
            } else {
                self.stop_ref_oid = None;
                self.stop_order_qty = 0.0;
            }
        }

        false
    }

    pub fn close(&mut self, broker: &dyn Broker, market_id: &str) -> bool {
        if let Some(create_oid) = self.create_oid.clone() {
            if broker.cancel_order(&create_oid) {
                self.create_ref_oid = None;
                self.create_oid = None;
                self.core.entry_state = TradeState::Canceled;
            }
        }

        if let Some(stop_oid) = self.stop_oid.clone() {
            if broker.cancel_order(&stop_oid) {
                self.stop_ref_oid = None;
                self.stop_oid = None;
                self.stop_order_qty = 0.0;
            }
        }

        if let Some(limit_oid) = self.limit_oid.clone() {
            if broker.cancel_order(&limit_oid) {
                self.limit_ref_oid = None;
                self.limit_oid = None;
                self.limit_order_qty = 0.0;
            }
        }

        if (self.core.e - self.core.x).abs() <= QTY_EPSILON {
            return true;
        }

        if self.core.e < self.core.x {
            return false;
        }

        let mut order = Order::new(
            market_id,
            self.core.close_direction(),
            OrderType::Market,
            self.core.e - self.core.x,
        );
        order.leverage = self.leverage;

        broker.set_ref_order_id(&mut order);
        self.stop_ref_oid = order.ref_order_id.clone();

        self.core.stats.exit_maker = !order.is_market();

        if broker.create_order(&mut order) {
            true
        } else {
            self.stop_ref_oid = None;
            false
        }
    }

    pub fn order_signal(&mut self, event: &OrderEvent, ref_order_id: Option<&str>) {
        match event {
            OrderEvent::Opened(data) => {
                if ref_order_id.is_some() && ref_order_id == self.create_ref_oid.as_deref() {
                    self.create_oid = Some(data.id.clone());
                    self.core.eot = data.timestamp;

                    if let Some(sl) = data.stop_loss {
                        self.core.sl = sl;
                    }
                    if let Some(tp) = data.take_profit {
                        self.core.tp = tp;
                    }

                    self.core.entry_state = TradeState::Opened;
                } else if ref_order_id.is_some() && ref_order_id == self.stop_ref_oid.as_deref() {
                    self.stop_oid = Some(data.id.clone());
                    self.core.xot = data.timestamp;
                } else if ref_order_id.is_some() && ref_order_id == self.limit_ref_oid.as_deref() {
                    self.limit_oid = Some(data.id.clone());
                    self.core.xot = data.timestamp;
                }
            }
            OrderEvent::Deleted(order_id) => {
                if Some(order_id.as_str()) == self.create_oid.as_deref() {
                    self.create_ref_oid = None;
                    self.create_oid = None;
                    self.core.entry_state = TradeState::Deleted;
                } else if Some(order_id.as_str()) == self.limit_oid.as_deref() {
                    self.limit_ref_oid = None;
                    self.limit_oid = None;
                } else if Some(order_id.as_str()) == self.stop_oid.as_deref() {
                    self.stop_ref_oid = None;
                    self.stop_oid = None;
                }
            }
            OrderEvent::Canceled(order_id) => {
                if Some(order_id.as_str()) == self.create_oid.as_deref() {
                    self.create_ref_oid = None;
                    self.create_oid = None;
                    self.core.entry_state = TradeState::Canceled;
                } else if Some(order_id.as_str()) == self.limit_oid.as_deref() {
                    self.limit_ref_oid = None;
                    self.limit_oid = None;
                } else if Some(order_id.as_str()) == self.stop_oid.as_deref() {
                    self.stop_ref_oid = None;
                    self.stop_oid = None;
                }
            }
            OrderEvent::Updated(order_id) => {
                debug!(order_id = %order_id, trade_id = self.core.id, "order updated");
            }
            OrderEvent::Traded(data) => {
                if Some(data.id.as_str()) == self.create_oid.as_deref() {
                    if self.core.apply_entry_fill(data) {
                        self.create_oid = None;
                        self.create_ref_oid = None;
                    }
                } else if Some(data.id.as_str()) == self.limit_oid.as_deref() {
                    if self.core.apply_exit_fill(data) {
                        self.limit_oid = None;
                        self.limit_ref_oid = None;
                    }
                } else if Some(data.id.as_str()) == self.stop_oid.as_deref() {
                    if self.core.apply_exit_fill(data) {
                        self.stop_oid = None;
                        self.stop_ref_oid = None;
                    }
                }
            }
        }
    }

    pub fn position_signal(&mut self, event: &PositionEvent, _ref_order_id: Option<&str>) {
        match event {
            PositionEvent::Deleted { exec_price, .. } => {
                self.position_id = None;
                self.create_oid = None;
                self.create_ref_oid = None;

                self.core.apply_position_deleted(*exec_price);
            }
        }
    }

    pub fn is_target_order(&self, order_id: Option<&str>, ref_order_id: Option<&str>) -> bool {
        if let Some(order_id) = order_id {
            if Some(order_id) == self.create_oid.as_deref()
                || Some(order_id) == self.stop_oid.as_deref()
                || Some(order_id) == self.limit_oid.as_deref()
            {
                return true;
            }
        }

        if let Some(ref_order_id) = ref_order_id {
            if Some(ref_order_id) == self.create_ref_oid.as_deref()
                || Some(ref_order_id) == self.stop_ref_oid.as_deref()
                || Some(ref_order_id) == self.limit_ref_oid.as_deref()
            {
                return true;
            }
        }

        false
    }

    pub fn is_target_position(&self, position_id: Option<&str>, ref_order_id: Option<&str>) -> bool {
        if position_id.is_some() && position_id == self.position_id.as_deref() {
            return true;
        }

        if ref_order_id.is_some() && ref_order_id == self.create_ref_oid.as_deref() {
            return true;
        }

        false
    }

    pub fn is_closing(&self) -> bool {
        self.limit_ref_oid.is_some() || self.stop_ref_oid.is_some() || self.core.is_closing()
    }

    pub fn dumps(&self) -> Value {
        let mut data = self.core.dumps();

        let map = data.as_object_mut().expect("core dump is a map");
        map.insert("create-ref-oid".into(), opt_str(&self.create_ref_oid));
        map.insert("stop-ref-oid".into(), opt_str(&self.stop_ref_oid));
        map.insert("limit-ref-oid".into(), opt_str(&self.limit_ref_oid));
        map.insert("create-oid".into(), opt_str(&self.create_oid));
        map.insert("stop-oid".into(), opt_str(&self.stop_oid));
        map.insert("limit-oid".into(), opt_str(&self.limit_oid));
        map.insert("position-id".into(), opt_str(&self.position_id));
        map.insert("leverage".into(), self.leverage.into());
        map.insert("hedging".into(), self.hedging.into());
        map.insert("stop-order-qty".into(), self.stop_order_qty.into());
        map.insert("limit-order-qty".into(), self.limit_order_qty.into());

        data
    }

    pub fn loads(&mut self, data: &Value) -> bool {
        if !self.core.loads(data) {
            return false;
        }

        self.create_ref_oid = str_field(data, "create-ref-oid");
        self.stop_ref_oid = str_field(data, "stop-ref-oid");
        self.limit_ref_oid = str_field(data, "limit-ref-oid");
        self.create_oid = str_field(data, "create-oid");
        self.stop_oid = str_field(data, "stop-oid");
        self.limit_oid = str_field(data, "limit-oid");
        self.position_id = str_field(data, "position-id");
        self.leverage = data.get("leverage").and_then(Value::as_f64).unwrap_or(1.0);
        self.hedging = data
            .get("hedging")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.stop_order_qty = data
            .get("stop-order-qty")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        self.limit_order_qty = data
            .get("limit-order-qty")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        true
    }
}

fn opt_str(value: &Option<String>) -> Value {
    match value {
        Some(v) => Value::String(v.clone()),
        None => Value::Null,
    }
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{OrderOpenedData, OrderTradedData, PaperBroker};
    use crate::instrument::{Instrument, MarketKind};
    use crate::types::Direction;

    fn margin_market() -> Instrument {
        Instrument {
            market_id: "ETHUSD".into(),
            symbol: "ETHUSD".into(),
            base: "ETH".into(),
            quote: "USD".into(),
            kind: MarketKind::Margin,
            tick_size: 0.05,
            step_size: 0.01,
            min_qty: 0.01,
            max_qty: 10_000.0,
            min_notional: 1.0,
            maker_fee: 0.0002,
            taker_fee: 0.0005,
            vol24h_quote: 5.0e8,
            last_price: 2_000.0,
            spread: 0.05,
            buy_sell_enabled: true,
            trader_quantity: 500.0,
        }
    }

    #[test]
    fn short_entry_with_leverage() {
        let broker = PaperBroker::new();
        broker.add_market(margin_market());

        let mut trade = MarginTrade::new(Timeframe::T1H);
        let request = OpenRequest {
            market_id: "ETHUSD".into(),
            direction: Direction::Short,
            order_type: OrderType::Limit,
            order_price: Some(2_000.0),
            quantity: 1.5,
            take_profit: None,
            stop_loss: None,
            leverage: 3.0,
        };
        assert!(trade.open(&broker, &request));
        assert_eq!(trade.core.direction, Direction::Short);
        assert_eq!(trade.leverage, 3.0);
        assert!(trade.position_id.is_some());
    }

    #[test]
    fn short_exit_pl_is_positive_when_price_drops() {
        let broker = PaperBroker::new();
        broker.add_market(margin_market());

        let mut trade = MarginTrade::new(Timeframe::T1H);
        let request = OpenRequest {
            market_id: "ETHUSD".into(),
            direction: Direction::Short,
            order_type: OrderType::Limit,
            order_price: Some(2_000.0),
            quantity: 1.0,
            take_profit: None,
            stop_loss: None,
            leverage: 1.0,
        };
        assert!(trade.open(&broker, &request));
        let ref_oid = trade.create_ref_oid.clone().unwrap();

        trade.order_signal(
            &OrderEvent::Opened(OrderOpenedData {
                id: "sell-1".into(),
                timestamp: 10.0,
                stop_loss: None,
                take_profit: None,
            }),
            Some(&ref_oid),
        );
        trade.order_signal(
            &OrderEvent::Traded(OrderTradedData {
                id: "sell-1".into(),
                filled: None,
                cumulative_filled: Some(1.0),
                avg_price: Some(2_000.0),
                exec_price: None,
            }),
            None,
        );

        trade.position_signal(
            &PositionEvent::Deleted {
                position_id: Some("ETHUSD".into()),
                exec_price: Some(1_900.0),
            },
            None,
        );

        assert!(trade.core.pl > 0.0, "short gains when price drops");
        assert!(trade.core.is_closed());
    }

    #[test]
    fn roundtrip_keeps_margin_fields() {
        let mut trade = MarginTrade::new(Timeframe::T4H);
        trade.core.id = 9;
        trade.leverage = 5.0;
        trade.hedging = true;
        trade.position_id = Some("pos-1".into());

        let dump = trade.dumps();
        let mut restored = MarginTrade::new(Timeframe::T1M);
        assert!(restored.loads(&dump));
        assert_eq!(restored.leverage, 5.0);
        assert!(restored.hedging);
        assert_eq!(restored.position_id.as_deref(), Some("pos-1"));
    }
}
