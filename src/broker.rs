// =============================================================================
// Broker abstraction — order model, normalized events, paper implementation
// =============================================================================
//
// The strategy core only ever talks to the `Broker` trait. Calls are
// blocking and surface booleans: a false return leaves trade state
// untouched and the caller must not pretend success.
//
// The `PaperBroker` simulates the exchange locally: orders are acknowledged
// immediately with generated ids and market orders fill at the instrument's
// last price. It backs the demo binary and the tests.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::instrument::Instrument;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Order model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    TakeProfitLimit,
}

/// An order request. The broker mutates `order_id`, `position_id` and
/// `created_time` on a successful `create_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub market_id: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit/stop trigger price; `None` for pure market orders.
    pub price: Option<f64>,
    /// May only decrease an existing position.
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Client-generated reference id correlating asynchronous acks.
    #[serde(default)]
    pub ref_order_id: Option<String>,
    /// Exchange-assigned id, available after `create_order`.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Position this order belongs to, when the venue models positions.
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub created_time: f64,
}

fn default_leverage() -> f64 {
    1.0
}

impl Order {
    pub fn new(
        market_id: &str,
        direction: Direction,
        order_type: OrderType,
        quantity: f64,
    ) -> Self {
        Self {
            market_id: market_id.to_string(),
            direction,
            order_type,
            quantity,
            price: None,
            reduce_only: false,
            leverage: 1.0,
            ref_order_id: None,
            order_id: None,
            position_id: None,
            created_time: 0.0,
        }
    }

    pub fn is_market(&self) -> bool {
        self.order_type == OrderType::Market
    }
}

// ---------------------------------------------------------------------------
// Normalized events delivered to the trade state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderOpenedData {
    pub id: String,
    pub timestamp: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTradedData {
    pub id: String,
    /// Incremental filled quantity of this execution.
    #[serde(default)]
    pub filled: Option<f64>,
    /// Cumulative filled quantity, broker-authoritative when present.
    #[serde(default)]
    pub cumulative_filled: Option<f64>,
    /// Broker-computed average fill price, authoritative when present.
    #[serde(default)]
    pub avg_price: Option<f64>,
    /// Price of this single execution.
    #[serde(default)]
    pub exec_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
    Opened(OrderOpenedData),
    Deleted(String),
    Canceled(String),
    /// Informational only; carries no authoritative action.
    Updated(String),
    Traded(OrderTradedData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionEvent {
    Deleted {
        position_id: Option<String>,
        exec_price: Option<f64>,
    },
}

/// Envelope travelling over the worker's bounded event queue. Preliminary
/// acknowledgements are matched through `ref_order_id`; every later event
/// matches through the exchange id inside the event itself.
#[derive(Debug, Clone)]
pub enum BrokerSignal {
    Order {
        event: OrderEvent,
        ref_order_id: Option<String>,
    },
    Position {
        event: PositionEvent,
        ref_order_id: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

/// Balance snapshot for a single asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: f64,
    pub locked: f64,
}

/// Blocking broker operations consumed by the strategy core.
pub trait Broker: Send + Sync {
    /// Submit an order. On success the order carries its assigned ids and
    /// creation time; on failure the order is left untouched.
    fn create_order(&self, order: &mut Order) -> bool;

    fn cancel_order(&self, order_id: &str) -> bool;

    /// Issue a unique client reference id and store it on the order.
    fn set_ref_order_id(&self, order: &mut Order) -> String;

    fn market(&self, market_id: &str) -> Option<Instrument>;

    fn has_asset(&self, asset: &str) -> bool;

    fn has_quantity(&self, asset: &str, quantity: f64) -> bool;

    fn asset(&self, asset: &str) -> Option<AssetBalance>;
}

// ---------------------------------------------------------------------------
// Paper broker
// ---------------------------------------------------------------------------

/// Local exchange simulation. Every accepted order is acknowledged with a
/// v4 uuid; market orders additionally emit an immediate full fill at the
/// instrument's last price. Events route to the sink registered for the
/// order's market.
pub struct PaperBroker {
    markets: RwLock<HashMap<String, Instrument>>,
    balances: RwLock<HashMap<String, AssetBalance>>,
    open_orders: RwLock<HashMap<String, Order>>,
    events: RwLock<HashMap<String, crossbeam_channel::Sender<BrokerSignal>>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            open_orders: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Register the event sink for one market.
    pub fn set_event_sink(
        &self,
        market_id: &str,
        sender: crossbeam_channel::Sender<BrokerSignal>,
    ) {
        self.events.write().insert(market_id.to_string(), sender);
    }

    pub fn add_market(&self, market: Instrument) {
        self.markets
            .write()
            .insert(market.market_id.clone(), market);
    }

    pub fn deposit(&self, asset: &str, amount: f64) {
        let mut balances = self.balances.write();
        let entry = balances.entry(asset.to_string()).or_default();
        entry.free += amount;
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.read().len()
    }

    fn emit(&self, market_id: &str, signal: BrokerSignal) {
        if let Some(sender) = self.events.read().get(market_id) {
            if sender.try_send(signal).is_err() {
                warn!(market_id, "paper broker event sink is full or closed, event dropped");
            }
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for PaperBroker {
    fn create_order(&self, order: &mut Order) -> bool {
        let market = match self.market(&order.market_id) {
            Some(market) => market,
            None => {
                warn!(market_id = %order.market_id, "create_order on unknown market");
                return false;
            }
        };

        if order.quantity <= 0.0 {
            warn!(market_id = %order.market_id, qty = order.quantity, "create_order with non-positive quantity");
            return false;
        }

        let order_id = Uuid::new_v4().to_string();
        order.order_id = Some(order_id.clone());
        // A single aggregated position per market.
        order.position_id = Some(order.market_id.clone());
        order.created_time = Utc::now().timestamp_millis() as f64 / 1000.0;

        self.open_orders
            .write()
            .insert(order_id.clone(), order.clone());

        info!(
            order_id = %order_id,
            market_id = %order.market_id,
            direction = %order.direction,
            qty = order.quantity,
            price = ?order.price,
            "paper order accepted"
        );

        self.emit(
            &order.market_id,
            BrokerSignal::Order {
                event: OrderEvent::Opened(OrderOpenedData {
                    id: order_id.clone(),
                    timestamp: order.created_time,
                    stop_loss: None,
                    take_profit: None,
                }),
                ref_order_id: order.ref_order_id.clone(),
            },
        );

        // Market orders fill immediately at the last price.
        if order.is_market() {
            let exec_price = order.price.unwrap_or(market.last_price);
            self.emit(
                &order.market_id,
                BrokerSignal::Order {
                    event: OrderEvent::Traded(OrderTradedData {
                        id: order_id.clone(),
                        filled: Some(order.quantity),
                        cumulative_filled: Some(order.quantity),
                        avg_price: Some(exec_price),
                        exec_price: Some(exec_price),
                    }),
                    ref_order_id: order.ref_order_id.clone(),
                },
            );
            self.open_orders.write().remove(&order_id);
        }

        true
    }

    fn cancel_order(&self, order_id: &str) -> bool {
        let removed = self.open_orders.write().remove(order_id);
        match removed {
            Some(order) => {
                debug!(order_id, market_id = %order.market_id, "paper order canceled");
                self.emit(
                    &order.market_id,
                    BrokerSignal::Order {
                        event: OrderEvent::Canceled(order_id.to_string()),
                        ref_order_id: order.ref_order_id.clone(),
                    },
                );
                true
            }
            None => {
                warn!(order_id, "cancel_order: unknown order id");
                false
            }
        }
    }

    fn set_ref_order_id(&self, order: &mut Order) -> String {
        let ref_id = Uuid::new_v4().to_string();
        order.ref_order_id = Some(ref_id.clone());
        ref_id
    }

    fn market(&self, market_id: &str) -> Option<Instrument> {
        self.markets.read().get(market_id).cloned()
    }

    fn has_asset(&self, asset: &str) -> bool {
        self.balances.read().contains_key(asset)
    }

    fn has_quantity(&self, asset: &str, quantity: f64) -> bool {
        self.balances
            .read()
            .get(asset)
            .map(|b| b.free >= quantity)
            .unwrap_or(false)
    }

    fn asset(&self, asset: &str) -> Option<AssetBalance> {
        self.balances.read().get(asset).copied()
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("markets", &self.markets.read().len())
            .field("open_orders", &self.open_orders.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MarketKind;

    fn market() -> Instrument {
        Instrument {
            market_id: "BTCUSDT".into(),
            symbol: "BTCUSDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            kind: MarketKind::IndivisibleMargin,
            tick_size: 0.01,
            step_size: 0.0001,
            min_qty: 0.0001,
            max_qty: 1000.0,
            min_notional: 10.0,
            maker_fee: 0.001,
            taker_fee: 0.001,
            vol24h_quote: 1.0e9,
            last_price: 40_000.0,
            spread: 0.5,
            buy_sell_enabled: true,
            trader_quantity: 100.0,
        }
    }

    #[test]
    fn create_order_assigns_ids_and_time() {
        let broker = PaperBroker::new();
        broker.add_market(market());

        let mut order = Order::new("BTCUSDT", Direction::Long, OrderType::Limit, 0.01);
        order.price = Some(40_000.0);
        broker.set_ref_order_id(&mut order);

        assert!(broker.create_order(&mut order));
        assert!(order.order_id.is_some());
        assert_eq!(order.position_id.as_deref(), Some("BTCUSDT"));
        assert!(order.created_time > 0.0);
        assert_eq!(broker.open_order_count(), 1);
    }

    #[test]
    fn create_order_unknown_market_fails_untouched() {
        let broker = PaperBroker::new();
        let mut order = Order::new("NOPEUSDT", Direction::Long, OrderType::Limit, 1.0);
        assert!(!broker.create_order(&mut order));
        assert!(order.order_id.is_none());
    }

    #[test]
    fn market_order_fills_immediately() {
        let broker = PaperBroker::new();
        broker.add_market(market());
        let (tx, rx) = crossbeam_channel::bounded(8);
        broker.set_event_sink("BTCUSDT", tx);

        let mut order = Order::new("BTCUSDT", Direction::Short, OrderType::Market, 0.5);
        broker.set_ref_order_id(&mut order);
        assert!(broker.create_order(&mut order));

        // Opened, then an immediate full fill at last price.
        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            BrokerSignal::Order {
                event: OrderEvent::Opened(_),
                ..
            }
        ));
        match rx.try_recv().unwrap() {
            BrokerSignal::Order {
                event: OrderEvent::Traded(data),
                ..
            } => {
                assert_eq!(data.cumulative_filled, Some(0.5));
                assert_eq!(data.avg_price, Some(40_000.0));
            }
            other => panic!("expected traded event, got {other:?}"),
        }
        assert_eq!(broker.open_order_count(), 0);
    }

    #[test]
    fn cancel_unknown_order_fails() {
        let broker = PaperBroker::new();
        assert!(!broker.cancel_order("missing"));
    }

    #[test]
    fn balances() {
        let broker = PaperBroker::new();
        broker.deposit("USDT", 250.0);
        assert!(broker.has_asset("USDT"));
        assert!(broker.has_quantity("USDT", 100.0));
        assert!(!broker.has_quantity("USDT", 300.0));
        assert_eq!(broker.asset("USDT").unwrap().free, 250.0);
        assert!(broker.asset("BTC").is_none());
    }
}
