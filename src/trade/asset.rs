// =============================================================================
// Asset trade — spot buy then sell
// =============================================================================
//
// No position exists on the venue: the trade buys the base asset and later
// sells the entered quantity, either through a stop or limit sell child or
// a direct market sell. Position events never target this variant.

use serde_json::Value;
use tracing::debug;

use crate::broker::{Broker, Order, OrderEvent, OrderType, PositionEvent};
use crate::timeframe::Timeframe;
use crate::trade::{OpenRequest, TradeCore, TradeKind, TradeState, QTY_EPSILON};
use crate::types::Direction;

#[derive(Debug, Clone)]
pub struct AssetTrade {
    pub core: TradeCore,

    pub entry_ref_oid: Option<String>,
    pub stop_ref_oid: Option<String>,
    pub limit_ref_oid: Option<String>,

    pub entry_oid: Option<String>,
    pub stop_oid: Option<String>,
    pub limit_oid: Option<String>,

    pub stop_order_qty: f64,
    pub limit_order_qty: f64,
}

impl AssetTrade {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            core: TradeCore::new(TradeKind::Asset, timeframe),
            entry_ref_oid: None,
            stop_ref_oid: None,
            limit_ref_oid: None,
            entry_oid: None,
            stop_oid: None,
            limit_oid: None,
            stop_order_qty: 0.0,
            limit_order_qty: 0.0,
        }
    }

    /// Buy the asset. Spot entries are always long.
    pub fn open(&mut self, broker: &dyn Broker, request: &OpenRequest) -> bool {
        let mut order = Order::new(
            &request.market_id,
            Direction::Long,
            request.order_type,
            request.quantity,
        );
        order.price = request.order_price;

        broker.set_ref_order_id(&mut order);
        self.entry_ref_oid = order.ref_order_id.clone();

        self.core.direction = Direction::Long;
        self.core.op = request.order_price.unwrap_or(0.0);
        self.core.oq = request.quantity;
        self.core.tp = request.take_profit.unwrap_or(0.0);
        self.core.sl = request.stop_loss.unwrap_or(0.0);

        self.core.stats.entry_maker = !order.is_market();

        if broker.create_order(&mut order) {
            if self.core.eot == 0.0 && order.created_time > 0.0 {
                self.core.eot = order.created_time;
            }
            true
        } else {
            self.entry_ref_oid = None;
            false
        }
    }

    pub fn remove(&mut self, broker: &dyn Broker) {
        if let Some(entry_oid) = self.entry_oid.clone() {
            if broker.cancel_order(&entry_oid) {
                self.entry_ref_oid = None;
                self.entry_oid = None;
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
        if let Some(entry_oid) = self.entry_oid.clone() {
            if broker.cancel_order(&entry_oid) {
                self.entry_ref_oid = None;
                self.entry_oid = None;
                self.core.entry_state = TradeState::Canceled;
            } else {
                return false;
            }
        }

        true
    }

    /// Cancel the remaining sell children (stop and limit).
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

    /// Replace the sell limit child at `price` for the remaining quantity.
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
                Direction::Short,
                OrderType::Limit,
                self.core.e - self.core.x,
            );
            order.price = Some(price);

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

    /// Replace the stop sell child at `price` for the remaining quantity.
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
                Direction::Short,
                OrderType::Stop,
                self.core.e - self.core.x,
            );
            order.price = Some(price);

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

    /// Cancel any children then sell the remaining quantity at market.
    pub fn close(&mut self, broker: &dyn Broker, market_id: &str) -> bool {
        if let Some(entry_oid) = self.entry_oid.clone() {
            if broker.cancel_order(&entry_oid) {
                self.entry_ref_oid = None;
                self.entry_oid = None;
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
            Direction::Short,
            OrderType::Market,
            self.core.e - self.core.x,
        );

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
                if ref_order_id.is_some() && ref_order_id == self.entry_ref_oid.as_deref() {
                    self.entry_oid = Some(data.id.clone());
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
                if Some(order_id.as_str()) == self.entry_oid.as_deref() {
                    self.entry_ref_oid = None;
                    self.entry_oid = None;
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
                if Some(order_id.as_str()) == self.entry_oid.as_deref() {
                    self.entry_ref_oid = None;
                    self.entry_oid = None;
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
                if Some(data.id.as_str()) == self.entry_oid.as_deref() {
                    if self.core.apply_entry_fill(data) {
                        self.entry_oid = None;
                        self.entry_ref_oid = None;
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

    /// Spot venues carry no positions.
    pub fn position_signal(&mut self, _event: &PositionEvent, _ref_order_id: Option<&str>) {}

    pub fn is_target_order(&self, order_id: Option<&str>, ref_order_id: Option<&str>) -> bool {
        if let Some(order_id) = order_id {
            if Some(order_id) == self.entry_oid.as_deref()
                || Some(order_id) == self.stop_oid.as_deref()
                || Some(order_id) == self.limit_oid.as_deref()
            {
                return true;
            }
        }

        if let Some(ref_order_id) = ref_order_id {
            if Some(ref_order_id) == self.entry_ref_oid.as_deref()
                || Some(ref_order_id) == self.stop_ref_oid.as_deref()
                || Some(ref_order_id) == self.limit_ref_oid.as_deref()
            {
                return true;
            }
        }

        false
    }

    pub fn is_target_position(&self, _position_id: Option<&str>, _ref_order_id: Option<&str>) -> bool {
        false
    }

    pub fn is_closing(&self) -> bool {
        self.limit_ref_oid.is_some() || self.stop_ref_oid.is_some() || self.core.is_closing()
    }

    pub fn dumps(&self) -> Value {
        let mut data = self.core.dumps();

        let map = data.as_object_mut().expect("core dump is a map");
        map.insert("entry-ref-oid".into(), opt_str(&self.entry_ref_oid));
        map.insert("stop-ref-oid".into(), opt_str(&self.stop_ref_oid));
        map.insert("limit-ref-oid".into(), opt_str(&self.limit_ref_oid));
        map.insert("entry-oid".into(), opt_str(&self.entry_oid));
        map.insert("stop-oid".into(), opt_str(&self.stop_oid));
        map.insert("limit-oid".into(), opt_str(&self.limit_oid));
        map.insert("stop-order-qty".into(), self.stop_order_qty.into());
        map.insert("limit-order-qty".into(), self.limit_order_qty.into());

        data
    }

    pub fn loads(&mut self, data: &Value) -> bool {
        if !self.core.loads(data) {
            return false;
        }

        self.entry_ref_oid = str_field(data, "entry-ref-oid");
        self.stop_ref_oid = str_field(data, "stop-ref-oid");
        self.limit_ref_oid = str_field(data, "limit-ref-oid");
        self.entry_oid = str_field(data, "entry-oid");
        self.stop_oid = str_field(data, "stop-oid");
        self.limit_oid = str_field(data, "limit-oid");
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
