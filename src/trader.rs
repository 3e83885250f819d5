// =============================================================================
// Strategy Trader — per-instrument orchestrator of signals, policy and trades
// =============================================================================
//
// Owns the instrument's bar engine, timeframe analysers and live trades.
// Per base-timeframe tick: synthesize bars, filter the market (cached one
// hour), collect candidate signals, recompute the reference-timeframe
// globals, process exits under the trade lock, then admit retained entries.
//
// Broker events and ticks arrive over bounded channels drained by the
// owning worker loop, making this type the single writer of its trade set.
// The reentrant mutex is kept around the trade list because admission
// checks and trade insertion nest inside sections that already hold it;
// the entry submission itself runs with the lock released.

use std::cell::RefCell;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::ReentrantMutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::analyser::{major_trend, TimeframeAnalyser};
use crate::bars::BarEngine;
use crate::broker::{Broker, BrokerSignal, OrderEvent, OrderType, PositionEvent};
use crate::config::StrategyParams;
use crate::indicators::IndicatorParams;
use crate::instrument::MarketKind;
use crate::notifier::{Notifier, OrderNotification, OrderPhase};
use crate::regions::{check_regions, TradeRegion};
use crate::signals::Signal;
use crate::timeframe::{Timeframe, TimeframeChain};
use crate::trade::{AssetTrade, IndMarginTrade, MarginTrade, OpenRequest, Trade, QTY_EPSILON};
use crate::types::{Direction, Tick};

/// Market filter results are recomputed at most once per hour.
const FILTER_CACHE_SECS: f64 = 3_600.0;

/// Capacity of the tick and broker-event queues.
const QUEUE_CAPACITY: usize = 1_024;

pub struct StrategyTrader {
    market_id: String,
    config: StrategyParams,
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,

    chain: TimeframeChain,
    bars: BarEngine,
    analysers: Vec<TimeframeAnalyser>,
    regions: Vec<TradeRegion>,

    /// Order placement enabled. When false only signal notifications with
    /// `trade_id = -1` are produced.
    activity: bool,

    trades: ReentrantMutex<RefCell<Vec<Trade>>>,
    next_trade_id: i64,

    ticks_tx: Sender<Tick>,
    ticks_rx: Receiver<Tick>,
    events_tx: Sender<BrokerSignal>,
    events_rx: Receiver<BrokerSignal>,

    /// `(timestamp, accept, compute)` of the last market filter pass.
    last_filter_cache: (f64, bool, bool),

    /// Major trend of the reference timeframe: -1, 0 or +1.
    pub major_trend: i32,
}

impl StrategyTrader {
    pub fn new(
        market_id: &str,
        config: StrategyParams,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, crate::error::EngineError> {
        let mut timeframes: Vec<Timeframe> =
            config.timeframes.iter().map(|t| t.timeframe).collect();
        timeframes.push(config.base_timeframe);

        let chain = TimeframeChain::new(timeframes).ok_or_else(|| {
            crate::error::EngineError::TimeframeChain(format!(
                "timeframes of {market_id} do not form a multiple chain"
            ))
        })?;

        let indicator_params = IndicatorParams {
            atr_multiplier: config.atr_stop_multiplier,
            ..IndicatorParams::default()
        };

        let depths: Vec<(Timeframe, usize)> = config
            .timeframes
            .iter()
            .map(|t| (t.timeframe, t.depth.max(indicator_params.max_lookback() + 1)))
            .collect();
        let bars = BarEngine::new(&chain, &depths, indicator_params.max_lookback() + 1);

        let analysers = config
            .timeframes
            .iter()
            .map(|t| TimeframeAnalyser::new(t.timeframe, t.mode, indicator_params.clone()))
            .collect();

        let (ticks_tx, ticks_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let (events_tx, events_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);

        Ok(Self {
            market_id: market_id.to_string(),
            config,
            broker,
            notifier,
            chain,
            bars,
            analysers,
            regions: Vec::new(),
            activity: true,
            trades: ReentrantMutex::new(RefCell::new(Vec::new())),
            next_trade_id: 1,
            ticks_tx,
            ticks_rx,
            events_tx,
            events_rx,
            last_filter_cache: (0.0, false, false),
            major_trend: 0,
        })
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn set_activity(&mut self, activity: bool) {
        self.activity = activity;
        info!(market_id = %self.market_id, activity, "trader activity switched");
    }

    pub fn set_regions(&mut self, regions: Vec<TradeRegion>) {
        self.regions = regions;
    }

    /// Producer side of the tick queue, handed to the market feed.
    pub fn tick_sender(&self) -> Sender<Tick> {
        self.ticks_tx.clone()
    }

    /// Producer side of the broker event queue, handed to the connector.
    pub fn event_sender(&self) -> Sender<BrokerSignal> {
        self.events_tx.clone()
    }

    /// Drop the cached market filter so the next tick recomputes it.
    pub fn invalidate_filter_cache(&mut self) {
        self.last_filter_cache = (0.0, false, false);
    }

    pub fn trade_count(&self) -> usize {
        self.with_trades(|trades| trades.len())
    }

    fn with_trades<T>(&self, f: impl FnOnce(&mut Vec<Trade>) -> T) -> T {
        let guard = self.trades.lock();
        let mut trades = guard.borrow_mut();
        f(&mut trades)
    }

    // -------------------------------------------------------------------------
    // Event intake
    // -------------------------------------------------------------------------

    /// Drain the broker event queue and dispatch each event to its owning
    /// trade. An event matching no trade is discarded with a log entry.
    pub fn dispatch_events(&mut self) -> usize {
        let mut dispatched = 0;

        while let Ok(signal) = self.events_rx.try_recv() {
            let matched = self.with_trades(|trades| {
                let target = match &signal {
                    BrokerSignal::Order {
                        event,
                        ref_order_id,
                    } => {
                        let order_id = order_event_id(event);
                        trades.iter_mut().find(|t| {
                            t.is_target_order(order_id, ref_order_id.as_deref())
                        })
                    }
                    BrokerSignal::Position {
                        event,
                        ref_order_id,
                    } => {
                        let position_id = position_event_id(event);
                        trades.iter_mut().find(|t| {
                            t.is_target_position(position_id, ref_order_id.as_deref())
                        })
                    }
                };

                match target {
                    Some(trade) => {
                        trade.dispatch(&signal);
                        true
                    }
                    None => false,
                }
            });

            if matched {
                dispatched += 1;
            } else {
                warn!(market_id = %self.market_id, event = ?signal, "correlation miss, event discarded");
            }
        }

        dispatched
    }

    // -------------------------------------------------------------------------
    // Market filter
    // -------------------------------------------------------------------------

    /// `(accept, compute)`: whether the market is tradable at all, and
    /// whether it is worth computing signals this pass. Cached one hour.
    pub fn filter_market(&mut self, timestamp: f64) -> (bool, bool) {
        if timestamp - self.last_filter_cache.0 < FILTER_CACHE_SECS {
            return (self.last_filter_cache.1, self.last_filter_cache.2);
        }

        let market = match self.broker.market(&self.market_id) {
            Some(market) => market,
            None => {
                self.last_filter_cache = (timestamp, false, false);
                return (false, false);
            }
        };

        if !market.buy_sell_enabled {
            self.last_filter_cache = (timestamp, false, false);
            return (false, false);
        }

        // without active trades, skip computation on uninteresting markets
        if self.trade_count() == 0 {
            if market.last_price > 0.0 && market.last_price < self.config.min_price {
                self.last_filter_cache = (timestamp, true, false);
                return (true, false);
            }

            if market.vol24h_quote > 0.0 && market.vol24h_quote < self.config.min_vol24h {
                self.last_filter_cache = (timestamp, true, false);
                return (true, false);
            }
        }

        self.last_filter_cache = (timestamp, true, true);
        (true, true)
    }

    // -------------------------------------------------------------------------
    // Per-tick processing
    // -------------------------------------------------------------------------

    /// Drain pending ticks. Returns how many were processed.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(tick) = self.ticks_rx.try_recv() {
            self.process_tick(&tick);
            processed += 1;
        }
        processed
    }

    /// The per-bar decision routine, run for every base-timeframe tick.
    pub fn process_tick(&mut self, tick: &Tick) {
        let timestamp = tick.timestamp;

        // 1. synthesize bars from the tick
        let closed = self.bars.ingest(tick);

        let (accept, compute) = self.filter_market(timestamp);
        if !accept {
            return;
        }

        // 2. candidate signals from every analyser whose bar closed
        let mut entries: Vec<Signal> = Vec::new();
        let mut exits: Vec<Signal> = Vec::new();

        let run_analysers = compute && (self.config.need_update || !closed.is_empty());
        if run_analysers {
            for analyser in &mut self.analysers {
                let series = match self.bars.series(analyser.timeframe()) {
                    Some(series) => series,
                    None => continue,
                };
                for signal in analyser.update(series, timestamp) {
                    if signal.is_entry() {
                        entries.push(signal);
                    } else {
                        exits.push(signal);
                    }
                }
            }
        }

        // 3. reference-timeframe globals and major trend
        let (last_price, trend) = {
            let reference = self.analyser(self.config.ref_timeframe);
            (
                reference
                    .and_then(|a| a.indicators().price)
                    .unwrap_or(tick.price),
                reference.map(|a| major_trend(a.indicators())).unwrap_or(0),
            )
        };
        self.major_trend = trend;

        // 4. entry filtering
        let retained_entries = self.filter_entries(entries, last_price);

        // 5. exits, timeouts and stop updates under the trade lock
        self.process_exits(&exits, timestamp, last_price);

        // 6. trade upkeep: stats, child adjustment, purge
        self.update_trades(timestamp, tick.price);

        // 7. submit retained entries
        for entry in retained_entries {
            self.process_entry(timestamp, &entry);
        }
    }

    fn analyser(&self, timeframe: Timeframe) -> Option<&TimeframeAnalyser> {
        self.analysers.iter().find(|a| a.timeframe() == timeframe)
    }

    /// Apply the admission filters and enrich candidates missing a stop or
    /// a target.
    fn filter_entries(&self, entries: Vec<Signal>, last_price: f64) -> Vec<Signal> {
        let mut retained = Vec::new();

        for mut entry in entries {
            // only the configured range of timeframes may trade
            if entry.timeframe < self.config.min_traded_timeframe
                || entry.timeframe > self.config.max_traded_timeframe
            {
                continue;
            }

            if !check_regions(&entry, &self.regions, self.config.region_allow) {
                continue;
            }

            // a missing stop comes from the parent timeframe's ATR
            if entry.stop_loss.is_none() {
                let parent = self.chain.parent(entry.timeframe);
                if let Some(sl) = self
                    .analyser(parent)
                    .and_then(|a| a.indicators().atr_stop_loss(entry.direction))
                {
                    let acceptable = match entry.direction {
                        Direction::Long => sl < last_price,
                        Direction::Short => sl > last_price,
                    };
                    if acceptable {
                        entry.stop_loss = Some(sl);
                    }
                }
            }

            // a missing target takes the third resistance of the
            // take-profit timeframe
            if entry.take_profit.is_none() {
                if let Some(resistances) = self
                    .analyser(self.config.tp_timeframe)
                    .and_then(|a| a.indicators().last_resistances())
                {
                    entry.take_profit = Some(resistances[2]);
                }
            }

            retained.push(entry);
        }

        retained
    }

    /// Exit processing: retained exit per trade, entry timeouts, validity
    /// expiry and the stop-update rule. Runs under the trade lock; the
    /// broker calls here are cancels and closes on already-known orders.
    fn process_exits(&mut self, exits: &[Signal], timestamp: f64, last_price: f64) {
        let config = &self.config;
        let chain = &self.chain;
        let market_id = self.market_id.clone();
        let broker = Arc::clone(&self.broker);

        let mut closed_exits: Vec<(i64, f64, Timeframe, Direction)> = Vec::new();

        let guard = self.trades.lock();
        {
            let mut trades = guard.borrow_mut();

            for trade in trades.iter_mut() {
                // user trades with pending operations stay untouched
                if trade.core().user_trade && trade.core().has_operations() {
                    continue;
                }

                // a problem trade waits for the operator
                if trade.core().state_to_str() == "problem" {
                    continue;
                }

                let retained_exit = exits
                    .iter()
                    .find(|signal| signal.timeframe == trade.core().timeframe);

                // unfilled entries are canceled after one timeframe
                if trade
                    .core()
                    .is_entry_timeout(timestamp, trade.core().timeframe.as_f64())
                {
                    trade.cancel_open(broker.as_ref());
                    info!(
                        market_id = %market_id,
                        trade_id = trade.core().id,
                        "canceled order (entry timeout)"
                    );
                    continue;
                }

                // a partially filled entry expires after the validity window
                let validity = trade.core().timeframe.as_f64() * config.entry_validity_factor;
                if trade.core().is_opening()
                    && trade.core().e > 0.0
                    && !trade.core().is_valid(timestamp, validity)
                {
                    trade.cancel_open(broker.as_ref());
                    info!(
                        market_id = %market_id,
                        trade_id = trade.core().id,
                        "canceled remainder (entry validity expired)"
                    );
                    continue;
                }

                // only active trades not already on their way out
                if !trade.core().is_active() || trade.is_closing() || trade.core().is_closed() {
                    continue;
                }

                // stop-loss update from the parent timeframe ATR
                let mut stop_loss = trade.core().sl;
                let parent = chain.parent(trade.core().timeframe);
                if let Some(sl) = self
                    .analysers
                    .iter()
                    .find(|a| a.timeframe() == parent)
                    .and_then(|a| a.indicators().atr_stop_loss(trade.core().direction))
                {
                    let no_prior_stop = trade.core().sl == 0.0;
                    let in_profit = last_price > trade.core().aep;
                    if (no_prior_stop || in_profit) && sl > stop_loss {
                        stop_loss = sl;
                    }
                }
                if stop_loss > trade.core().sl {
                    trade.core_mut().sl = stop_loss;
                }

                // exit at market when a retained exit signal exists
                if let Some(signal) = retained_exit {
                    if self.activity && trade.close(broker.as_ref(), &market_id) {
                        closed_exits.push((
                            trade.core().id,
                            signal.price,
                            trade.core().timeframe,
                            trade.core().direction,
                        ));

                        // estimated fee notional for the statistics record
                        if let Some(market) = broker.market(&market_id) {
                            let entry_rate = if trade.core().stats.entry_maker {
                                market.maker_fee
                            } else {
                                market.taker_fee
                            };
                            let exit_rate = if trade.core().stats.exit_maker {
                                market.maker_fee
                            } else {
                                market.taker_fee
                            };
                            let core = trade.core_mut();
                            core.stats.entry_fees = entry_rate * core.aep * core.e;
                            core.stats.exit_fees = exit_rate * signal.price * core.e;
                        }
                    }
                }
            }
        }
        drop(guard);

        // estimated P/L net of fees in the exit notifications
        for (trade_id, exit_price, timeframe, direction) in closed_exits {
            let mut profit_loss_rate = self.with_trades(|trades| {
                trades
                    .iter()
                    .find(|t| t.core().id == trade_id)
                    .map(|t| {
                        let aep = t.core().aep;
                        if aep > 0.0 {
                            direction.factor() * (exit_price - aep) / aep
                        } else {
                            0.0
                        }
                    })
                    .unwrap_or(0.0)
            });

            if let Some(market) = self.broker.market(&self.market_id) {
                let rates = self.with_trades(|trades| {
                    trades
                        .iter()
                        .find(|t| t.core().id == trade_id)
                        .map(|t| (t.core().stats.entry_maker, t.core().stats.exit_maker))
                });
                if let Some((entry_maker, exit_maker)) = rates {
                    profit_loss_rate -= if entry_maker {
                        market.maker_fee
                    } else {
                        market.taker_fee
                    };
                    profit_loss_rate -= if exit_maker {
                        market.maker_fee
                    } else {
                        market.taker_fee
                    };
                }
            }

            self.notifier.notify_order(OrderNotification {
                trade_id,
                direction,
                market_id: self.market_id.clone(),
                price: exit_price,
                timestamp,
                timeframe,
                phase: OrderPhase::Exit,
                profit_loss_rate: Some(profit_loss_rate),
                stop_loss: None,
                take_profit: None,
            });
        }
    }

    /// Trade upkeep: best/worst statistics, resting-child adjustment after
    /// partial entry fills, and purge of deletable trades.
    fn update_trades(&mut self, timestamp: f64, last_price: f64) {
        let broker = Arc::clone(&self.broker);
        let market_id = self.market_id.clone();

        self.with_trades(|trades| {
            for trade in trades.iter_mut() {
                trade.core_mut().update_stats(last_price, timestamp);

                if trade.core().user_trade && trade.core().has_operations() {
                    continue;
                }

                if trade.core().state_to_str() == "problem" {
                    continue;
                }

                if !trade.core().is_active() || trade.core().is_closed() {
                    continue;
                }

                // exit children cover the entered-but-not-exited quantity;
                // partial entry fills leave them undersized
                let remaining = trade.core().e - trade.core().x;
                if remaining <= QTY_EPSILON {
                    continue;
                }

                let tp = trade.core().tp;
                if tp > 0.0 && (trade.limit_order_qty() - remaining).abs() > QTY_EPSILON {
                    trade.modify_take_profit(broker.as_ref(), &market_id, tp);
                }

                let sl = trade.core().sl;
                if sl > 0.0 && (trade.stop_order_qty() - remaining).abs() > QTY_EPSILON {
                    trade.modify_stop_loss(broker.as_ref(), &market_id, sl);
                }
            }

            trades.retain(|trade| {
                if trade.core().can_delete() || trade.core().is_canceled() {
                    debug!(
                        market_id = %market_id,
                        trade_id = trade.core().id,
                        state = trade.core().state_to_str(),
                        pl = trade.core().pl,
                        "trade removed"
                    );
                    false
                } else {
                    true
                }
            });
        });
    }

    /// Entry admission and submission. Checks run under the trade lock;
    /// the lock is released before the entry order is placed.
    pub fn process_entry(&mut self, timestamp: f64, entry: &Signal) {
        let market = match self.broker.market(&self.market_id) {
            Some(market) => market,
            None => return,
        };

        // limit at the signal price plus the current spread
        let price = entry.price + market.spread;

        // quote budget per entry: instrument override, config fallback
        let budget = if market.trader_quantity > 0.0 {
            market.trader_quantity
        } else {
            self.config.quote_budget
        };

        let mut quantity = 0.0;
        if self.broker.has_asset(&market.quote) {
            if self.broker.has_quantity(&market.quote, budget) {
                quantity = market.adjust_quantity(budget / price);
            } else {
                let free = self
                    .broker
                    .asset(&market.quote)
                    .map(|a| a.free)
                    .unwrap_or(0.0);
                info!(
                    market_id = %self.market_id,
                    quote = %market.quote,
                    free = %market.format_quantity(free),
                    needed = %market.format_quantity(budget),
                    "not enough free quote asset"
                );
            }
        }

        let mut do_order = self.activity;

        let order_price = market.adjust_price(price);

        if quantity <= 0.0 || quantity * price < market.min_notional {
            // min notional not reached
            do_order = false;
        }

        {
            let guard = self.trades.lock();
            let trades = guard.borrow();

            if trades.len() >= self.config.max_trades {
                do_order = false;
            }

            // one trade per timeframe
            if trades
                .iter()
                .any(|t| t.core().timeframe == entry.timeframe)
            {
                do_order = false;
            }

            // the same-direction entry just after the previous one is noise
            if let Some(last) = trades.last() {
                if last.core().direction == entry.direction
                    && (timestamp - last.core().eot) < entry.timeframe.as_f64()
                {
                    do_order = false;
                }
            }
        }

        if do_order {
            let mut trade = self.make_trade(market.kind, entry.timeframe);
            let core = trade.core_mut();
            core.id = self.next_trade_id;
            for (name, value) in &entry.conditions {
                core.add_condition(name, *value);
            }

            let request = OpenRequest {
                market_id: self.market_id.clone(),
                direction: entry.direction,
                order_type: OrderType::Limit,
                order_price: Some(order_price),
                quantity,
                take_profit: entry.take_profit,
                stop_loss: entry.stop_loss,
                leverage: 1.0,
            };

            // lock released: the create call blocks on the broker
            if trade.open(self.broker.as_ref(), &request) {
                self.next_trade_id += 1;

                let (sl, tp) = (trade.core().sl, trade.core().tp);
                let trade_id = trade.core().id;

                self.with_trades(|trades| trades.push(trade));

                self.notifier.notify_order(OrderNotification {
                    trade_id,
                    direction: entry.direction,
                    market_id: self.market_id.clone(),
                    price: order_price,
                    timestamp,
                    timeframe: entry.timeframe,
                    phase: OrderPhase::Entry,
                    profit_loss_rate: None,
                    stop_loss: (sl > 0.0).then_some(sl),
                    take_profit: (tp > 0.0).then_some(tp),
                });
            } else {
                warn!(
                    market_id = %self.market_id,
                    timeframe = %entry.timeframe,
                    "entry order refused by broker"
                );
            }
        } else {
            // signal-only notification
            self.notifier.notify_order(OrderNotification {
                trade_id: -1,
                direction: entry.direction,
                market_id: self.market_id.clone(),
                price: order_price,
                timestamp,
                timeframe: entry.timeframe,
                phase: OrderPhase::Entry,
                profit_loss_rate: None,
                stop_loss: entry.stop_loss,
                take_profit: entry.take_profit,
            });
        }
    }

    fn make_trade(&self, kind: MarketKind, timeframe: Timeframe) -> Trade {
        match kind {
            MarketKind::Spot => Trade::Asset(AssetTrade::new(timeframe)),
            MarketKind::Margin => Trade::Margin(MarginTrade::new(timeframe)),
            MarketKind::IndivisibleMargin => Trade::IndMargin(IndMarginTrade::new(timeframe)),
        }
    }

    // -------------------------------------------------------------------------
    // Persistence taps
    // -------------------------------------------------------------------------

    /// Snapshot every live trade.
    pub fn dump_trades(&self) -> Value {
        let dumps: Vec<Value> = self.with_trades(|trades| trades.iter().map(|t| t.dumps()).collect());
        json!({ "market-id": self.market_id, "trades": dumps })
    }

    /// Restore trades from a snapshot, replacing the current set. Returns
    /// the number restored.
    pub fn load_trades(&mut self, data: &Value) -> usize {
        let dumps = match data.get("trades").and_then(Value::as_array) {
            Some(dumps) => dumps,
            None => return 0,
        };

        let mut restored = Vec::new();
        for dump in dumps {
            match Trade::from_dump(dump) {
                Some(trade) => restored.push(trade),
                None => warn!(market_id = %self.market_id, "malformed trade snapshot skipped"),
            }
        }

        let count = restored.len();
        let max_id = restored.iter().map(|t| t.core().id).max().unwrap_or(0);
        self.next_trade_id = self.next_trade_id.max(max_id + 1);
        self.with_trades(|trades| *trades = restored);

        info!(market_id = %self.market_id, count, "trades restored");
        count
    }
}

impl std::fmt::Debug for StrategyTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyTrader")
            .field("market_id", &self.market_id)
            .field("trades", &self.trade_count())
            .field("activity", &self.activity)
            .finish()
    }
}

fn order_event_id(event: &OrderEvent) -> Option<&str> {
    match event {
        OrderEvent::Opened(data) => Some(data.id.as_str()),
        OrderEvent::Deleted(id) | OrderEvent::Canceled(id) | OrderEvent::Updated(id) => {
            Some(id.as_str())
        }
        OrderEvent::Traded(data) => Some(data.id.as_str()),
    }
}

fn position_event_id(event: &PositionEvent) -> Option<&str> {
    match event {
        PositionEvent::Deleted { position_id, .. } => position_id.as_deref(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
