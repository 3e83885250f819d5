// =============================================================================
// Indivisible margin trade — one aggregated position per market, no hedging
// =============================================================================
//
// The venue keeps a single position per market without integrated
// stop/limit, so protective exits are standalone reduce-only child orders
// sized to the filled quantity. A deleted position means every related
// trade is closed, whatever the order of events (manual close, liquidation).
//
// Some venues never emit a terminal order-deleted event for a fully filled
// order; reaching the filled state therefore self-clears the corresponding
// order id and client reference.

use serde_json::Value;
use tracing::debug;

use crate::broker::{Broker, Order, OrderEvent, OrderType, PositionEvent};
use crate::timeframe::Timeframe;
use crate::trade::{OpenRequest, TradeCore, TradeKind, TradeState, QTY_EPSILON};

#[derive(Debug, Clone)]
pub struct IndMarginTrade {
    pub core: TradeCore,

    pub create_ref_oid: Option<String>,
    pub stop_ref_oid: Option<String>,
    pub limit_ref_oid: Option<String>,

    /// Entry order id.
    pub create_oid: Option<String>,
    /// Stop child order id.
    pub stop_oid: Option<String>,
    /// Limit child order id.
    pub limit_oid: Option<String>,

    pub position_id: Option<String>,

    /// Quantity resting on the stop child when `stop_oid` is set.
    pub stop_order_qty: f64,
    /// Quantity resting on the limit child when `limit_oid` is set.
    pub limit_order_qty: f64,
}

impl IndMarginTrade {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            core: TradeCore::new(TradeKind::IndMargin, timeframe),
            create_ref_oid: None,
            stop_ref_oid: None,
            limit_ref_oid: None,
            create_oid: None,
            stop_oid: None,
            limit_oid: None,
            position_id: None,
            stop_order_qty: 0.0,
            limit_order_qty: 0.0,
        }
    }

    /// Submit the entry order. On success the broker artifacts are wired to
    /// this trade; on failure the reference id is released and no state
    /// changes.
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

        self.core.direction = request.direction;
        self.core.op = request.order_price.unwrap_or(0.0);
        self.core.oq = request.quantity;
        self.core.tp = request.take_profit.unwrap_or(0.0);
        self.core.sl = request.stop_loss.unwrap_or(0.0);

        self.core.stats.entry_maker = !order.is_market();

        if broker.create_order(&mut order) {
            // might be the market id on single-position venues
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

    /// Cancel the remaining orders, but do not close the position.
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

    /// Cancel the entire or remaining entry order.
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

    /// Replace the limit child with one at `price`, sized to the remaining
    /// quantity. A refused cancel aborts the modify: the old child stays
    /// authoritative.
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
            // everything entered is already exited
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
            order.reduce_only = true;

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

    /// Replace the stop child with one at `price`; same contract as
    /// [`Self::modify_take_profit`].
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
            order.reduce_only = true;

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

    /// Cancel every open child, then close the remaining quantity with a
    /// reduce-only market order in the opposite direction.
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
            // nothing left to cover
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
        order.reduce_only = true;

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

    // -------------------------------------------------------------------------
    // Event application
    // -------------------------------------------------------------------------

    pub fn order_signal(&mut self, event: &OrderEvent, ref_order_id: Option<&str>) {
        match event {
            OrderEvent::Opened(data) => {
                if ref_order_id.is_some() && ref_order_id == self.create_ref_oid.as_deref() {
                    self.create_oid = Some(data.id.clone());

                    // created timestamp from the exchange ack
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
                // informational; price/qty changes carry no authoritative
                // action because the strategy may replace the order anyway
                debug!(order_id = %order_id, trade_id = self.core.id, "order updated");
            }
            OrderEvent::Traded(data) => {
                if Some(data.id.as_str()) == self.create_oid.as_deref() {
                    if self.core.apply_entry_fill(data) {
                        // no terminal deleted event on some venues
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
                // the position is gone (manual close, liquidation): converge
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

    /// A pending child reference also counts as closing: the ack may still
    /// be in flight.
    pub fn is_closing(&self) -> bool {
        self.limit_ref_oid.is_some() || self.stop_ref_oid.is_some() || self.core.is_closing()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn dumps(&self) -> Value {
        let mut data = self.core.dumps();

        let map = data.as_object_mut().expect("core dump is a map");
        map.insert("create-ref-oid".into(), json_opt(&self.create_ref_oid));
        map.insert("stop-ref-oid".into(), json_opt(&self.stop_ref_oid));
        map.insert("limit-ref-oid".into(), json_opt(&self.limit_ref_oid));
        map.insert("create-oid".into(), json_opt(&self.create_oid));
        map.insert("stop-oid".into(), json_opt(&self.stop_oid));
        map.insert("limit-oid".into(), json_opt(&self.limit_oid));
        map.insert("position-id".into(), json_opt(&self.position_id));
        map.insert("stop-order-qty".into(), self.stop_order_qty.into());
        map.insert("limit-order-qty".into(), self.limit_order_qty.into());

        data
    }

    pub fn loads(&mut self, data: &Value) -> bool {
        if !self.core.loads(data) {
            return false;
        }

        self.create_ref_oid = get_str(data, "create-ref-oid");
        self.stop_ref_oid = get_str(data, "stop-ref-oid");
        self.limit_ref_oid = get_str(data, "limit-ref-oid");
        self.create_oid = get_str(data, "create-oid");
        self.stop_oid = get_str(data, "stop-oid");
        self.limit_oid = get_str(data, "limit-oid");
        self.position_id = get_str(data, "position-id");
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

fn json_opt(value: &Option<String>) -> Value {
    match value {
        Some(v) => Value::String(v.clone()),
        None => Value::Null,
    }
}

fn get_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AssetBalance, OrderOpenedData, OrderTradedData};
    use crate::instrument::Instrument;
    use crate::types::Direction;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Minimal scriptable broker: create/cancel outcomes are switchable.
    struct StubBroker {
        accept_create: AtomicBool,
        accept_cancel: AtomicBool,
        counter: AtomicU32,
    }

    impl StubBroker {
        fn new() -> Self {
            Self {
                accept_create: AtomicBool::new(true),
                accept_cancel: AtomicBool::new(true),
                counter: AtomicU32::new(0),
            }
        }

        fn refuse_cancel(&self) {
            self.accept_cancel.store(false, Ordering::SeqCst);
        }

        fn refuse_create(&self) {
            self.accept_create.store(false, Ordering::SeqCst);
        }
    }

    impl Broker for StubBroker {
        fn create_order(&self, order: &mut Order) -> bool {
            if !self.accept_create.load(Ordering::SeqCst) {
                return false;
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            order.order_id = Some(format!("ord-{n}"));
            order.position_id = Some(order.market_id.clone());
            order.created_time = 1_000.0 + n as f64;
            true
        }

        fn cancel_order(&self, _order_id: &str) -> bool {
            self.accept_cancel.load(Ordering::SeqCst)
        }

        fn set_ref_order_id(&self, order: &mut Order) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let ref_id = format!("ref-{n}");
            order.ref_order_id = Some(ref_id.clone());
            ref_id
        }

        fn market(&self, _market_id: &str) -> Option<Instrument> {
            None
        }

        fn has_asset(&self, _asset: &str) -> bool {
            true
        }

        fn has_quantity(&self, _asset: &str, _quantity: f64) -> bool {
            true
        }

        fn asset(&self, _asset: &str) -> Option<AssetBalance> {
            None
        }
    }

    fn open_request(quantity: f64, price: f64) -> OpenRequest {
        OpenRequest {
            market_id: "XBTUSD".into(),
            direction: Direction::Long,
            order_type: OrderType::Limit,
            order_price: Some(price),
            quantity,
            take_profit: None,
            stop_loss: Some(95.0),
            leverage: 1.0,
        }
    }

    fn opened_trade(broker: &StubBroker) -> IndMarginTrade {
        let mut trade = IndMarginTrade::new(Timeframe::T15M);
        assert!(trade.open(broker, &open_request(10.0, 100.0)));

        let ref_oid = trade.create_ref_oid.clone().unwrap();
        trade.order_signal(
            &OrderEvent::Opened(OrderOpenedData {
                id: "entry-1".into(),
                timestamp: 1_000.0,
                stop_loss: None,
                take_profit: None,
            }),
            Some(&ref_oid),
        );
        trade
    }

    fn fill(id: &str, cumulative: f64, avg: f64) -> OrderEvent {
        OrderEvent::Traded(OrderTradedData {
            id: id.into(),
            filled: None,
            cumulative_filled: Some(cumulative),
            avg_price: Some(avg),
            exec_price: None,
        })
    }

    #[test]
    fn open_wires_ids_and_state() {
        let broker = StubBroker::new();
        let trade = opened_trade(&broker);

        assert_eq!(trade.core.entry_state, TradeState::Opened);
        assert_eq!(trade.create_oid.as_deref(), Some("entry-1"));
        assert_eq!(trade.position_id.as_deref(), Some("XBTUSD"));
        assert_eq!(trade.core.eot, 1_000.0);
        assert_eq!(trade.core.sl, 95.0);
        assert!(trade.core.stats.entry_maker);
    }

    #[test]
    fn open_failure_rolls_back_ref() {
        let broker = StubBroker::new();
        broker.refuse_create();
        let mut trade = IndMarginTrade::new(Timeframe::T15M);
        assert!(!trade.open(&broker, &open_request(10.0, 100.0)));
        assert!(trade.create_ref_oid.is_none());
        assert_eq!(trade.core.entry_state, TradeState::New);
    }

    #[test]
    fn entry_filled_tp_hit_closes_the_trade() {
        // Literal scenario: dir=+1, oq=10, op=100; OPENED; cum=10@100;
        // TP at 110; limit child fills cum=10@110.
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);

        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);
        assert_eq!(trade.core.entry_state, TradeState::Filled);
        // self-cleared: no terminal deleted event on this venue
        assert!(trade.create_oid.is_none());
        assert!(trade.create_ref_oid.is_none());

        assert!(trade.modify_take_profit(&broker, "XBTUSD", 110.0));
        assert_eq!(trade.core.tp, 110.0);
        assert!((trade.limit_order_qty - 10.0).abs() < 1e-12);
        let limit_oid = trade.limit_oid.clone().unwrap();

        trade.order_signal(&fill(&limit_oid, 10.0, 110.0), None);

        assert_eq!(trade.core.e, 10.0);
        assert_eq!(trade.core.x, 10.0);
        assert_eq!(trade.core.aep, 100.0);
        assert_eq!(trade.core.axp, 110.0);
        assert!((trade.core.pl - 0.10).abs() < 1e-9);
        assert!(trade.core.is_closed());
        assert_eq!(trade.core.state_to_str(), "closed");
        assert!(trade.limit_oid.is_none());
        assert!(trade.limit_ref_oid.is_none());
    }

    #[test]
    fn partial_entry_then_cancel_keeps_filled_qty() {
        // Literal scenario: oq=10, cum=3 at 100, then the remainder is
        // canceled after the entry timeout.
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);

        trade.order_signal(&fill("entry-1", 3.0, 100.0), None);
        assert_eq!(trade.core.entry_state, TradeState::PartiallyFilled);
        assert_eq!(trade.core.state_to_str(), "filling");

        assert!(trade.cancel_open(&broker));
        trade.order_signal(&OrderEvent::Canceled("entry-1".into()), None);
        assert_eq!(trade.core.e, 3.0);
        assert!(trade.create_oid.is_none());
        // entered quantity remains to be exited
        assert!(trade.core.is_active());
    }

    #[test]
    fn refused_cancel_aborts_modify() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);

        assert!(trade.modify_take_profit(&broker, "XBTUSD", 110.0));
        let old_limit = trade.limit_oid.clone();

        broker.refuse_cancel();
        assert!(!trade.modify_take_profit(&broker, "XBTUSD", 115.0));
        // old child remains authoritative
        assert_eq!(trade.limit_oid, old_limit);
        assert_eq!(trade.core.tp, 110.0);
    }

    #[test]
    fn modify_stop_loss_places_reduce_only_child() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);

        assert!(trade.modify_stop_loss(&broker, "XBTUSD", 97.0));
        assert_eq!(trade.core.sl, 97.0);
        assert!(trade.stop_oid.is_some());
        assert!((trade.stop_order_qty - 10.0).abs() < 1e-12);
    }

    #[test]
    fn modify_with_nothing_entered_places_no_child() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        // e == x == 0: nothing to cover, the modify reports done.
        assert!(trade.modify_take_profit(&broker, "XBTUSD", 110.0));
        assert!(trade.limit_oid.is_none());
    }

    #[test]
    fn position_deleted_mid_exit_converges() {
        // Literal scenario: long, e=5, x=2, position deleted at 120.
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.core.oq = 5.0;
        trade.order_signal(&fill("entry-1", 5.0, 100.0), None);

        assert!(trade.modify_take_profit(&broker, "XBTUSD", 120.0));
        let limit_oid = trade.limit_oid.clone().unwrap();
        trade.order_signal(
            &OrderEvent::Traded(OrderTradedData {
                id: limit_oid,
                filled: None,
                cumulative_filled: Some(2.0),
                avg_price: None,
                exec_price: Some(120.0),
            }),
            None,
        );
        assert_eq!(trade.core.x, 2.0);

        trade.position_signal(
            &PositionEvent::Deleted {
                position_id: Some("XBTUSD".into()),
                exec_price: Some(120.0),
            },
            None,
        );

        assert_eq!(trade.core.x, 5.0);
        assert_eq!(trade.core.exit_state, TradeState::Filled);
        assert!(trade.position_id.is_none());
        assert!(trade.core.is_closed());
    }

    #[test]
    fn cancel_close_clears_children() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);
        assert!(trade.modify_stop_loss(&broker, "XBTUSD", 95.0));
        assert!(trade.modify_take_profit(&broker, "XBTUSD", 110.0));

        assert!(trade.cancel_close(&broker));
        assert!(trade.stop_oid.is_none());
        assert!(trade.limit_oid.is_none());
        assert_eq!(trade.stop_order_qty, 0.0);

        // a refused cancel leaves the remaining child authoritative
        assert!(trade.modify_stop_loss(&broker, "XBTUSD", 96.0));
        broker.refuse_cancel();
        assert!(!trade.cancel_close(&broker));
        assert!(trade.stop_oid.is_some());
    }

    #[test]
    fn close_cancels_children_and_markets_the_rest() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);
        assert!(trade.modify_stop_loss(&broker, "XBTUSD", 95.0));

        assert!(trade.close(&broker, "XBTUSD"));
        // the close's market order reference is tracked through the stop slot
        assert!(trade.stop_ref_oid.is_some());
    }

    #[test]
    fn close_with_nothing_remaining_is_true() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);
        trade.core.x = 10.0;
        trade.core.exit_state = TradeState::Filled;
        assert!(trade.close(&broker, "XBTUSD"));
    }

    #[test]
    fn correlation_targets() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.order_signal(&fill("entry-1", 10.0, 100.0), None);
        assert!(trade.modify_stop_loss(&broker, "XBTUSD", 95.0));

        let stop_oid = trade.stop_oid.clone().unwrap();
        let stop_ref = trade.stop_ref_oid.clone().unwrap();

        assert!(trade.is_target_order(Some(&stop_oid), None));
        assert!(trade.is_target_order(None, Some(&stop_ref)));
        assert!(!trade.is_target_order(Some("unknown"), Some("unknown")));

        assert!(trade.is_target_position(Some("XBTUSD"), None));
        assert!(!trade.is_target_position(Some("ETHUSD"), None));
    }

    #[test]
    fn dumps_loads_roundtrip() {
        let broker = StubBroker::new();
        let mut trade = opened_trade(&broker);
        trade.core.id = 7;
        trade.order_signal(&fill("entry-1", 4.0, 100.25), None);
        assert!(trade.modify_stop_loss(&broker, "XBTUSD", 96.5));

        let dump = trade.dumps();

        let mut restored = IndMarginTrade::new(Timeframe::T1M);
        assert!(restored.loads(&dump));

        assert_eq!(restored.core.id, 7);
        assert_eq!(restored.core.e, trade.core.e);
        assert_eq!(restored.core.aep, trade.core.aep);
        assert_eq!(restored.core.sl, trade.core.sl);
        assert_eq!(restored.core.entry_state, trade.core.entry_state);
        assert_eq!(restored.stop_oid, trade.stop_oid);
        assert_eq!(restored.stop_ref_oid, trade.stop_ref_oid);
        assert_eq!(restored.position_id, trade.position_id);
        assert_eq!(restored.stop_order_qty, trade.stop_order_qty);
    }
}
