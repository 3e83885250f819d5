// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Wires the paper broker, one strategy worker per configured symbol, and a
// tick feed (a JSONL replay file via MERIDIAN_TICKS, or a deterministic
// synthetic session). A live exchange connector plugs in through the same
// Broker trait and event channels.
// =============================================================================

mod analyser;
mod bars;
mod broker;
mod config;
mod error;
mod indicators;
mod instrument;
mod notifier;
mod regions;
mod service;
mod signals;
mod strategy_worker;
mod timeframe;
mod trade;
mod trader;
mod types;
mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use crossbeam_channel::Sender;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{Broker, PaperBroker};
use crate::config::EngineConfig;
use crate::instrument::{Instrument, MarketKind};
use crate::notifier::{LogNotifier, Notifier};
use crate::service::WorkerService;
use crate::strategy_worker::StrategyWorker;
use crate::trader::StrategyTrader;
use crate::types::Tick;

fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trading Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("meridian.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        anyhow::bail!("no symbols configured");
    }

    // ── 2. Paper broker & markets ────────────────────────────────────────
    let broker = Arc::new(PaperBroker::new());
    broker.deposit("USDT", 10_000.0);
    for symbol in &config.symbols {
        broker.add_market(demo_market(symbol));
    }

    let notifier = Arc::new(LogNotifier) as Arc<dyn Notifier>;

    // ── 3. One strategy worker per symbol ────────────────────────────────
    let mut service = WorkerService::new();
    let mut feeds: HashMap<String, Sender<Tick>> = HashMap::new();

    for symbol in &config.symbols {
        let mut trader = StrategyTrader::new(
            symbol,
            config.strategy.clone(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&notifier),
        )?;
        trader.set_activity(config.activity);

        broker.set_event_sink(symbol, trader.event_sender());
        feeds.insert(symbol.clone(), trader.tick_sender());

        let snapshot = PathBuf::from(format!("{}.trades.json", symbol.to_lowercase()));
        service.start(StrategyWorker::new(trader, Some(snapshot)), config.benchmark)?;
    }

    info!(workers = service.len(), "strategy workers running");

    // ── 4. Tick feed ─────────────────────────────────────────────────────
    let fed = match std::env::var("MERIDIAN_TICKS") {
        Ok(path) => replay_file(&path, &feeds)?,
        Err(_) => synthetic_session(&feeds),
    };
    info!(ticks = fed, "tick feed finished");

    // let the workers drain their queues
    std::thread::sleep(std::time::Duration::from_millis(500));

    service.ping();
    std::thread::sleep(std::time::Duration::from_millis(200));

    service.dump();
    std::thread::sleep(std::time::Duration::from_millis(200));

    service.terminate();
    info!("engine stopped");
    Ok(())
}

/// A synthetic spot market for the paper session.
fn demo_market(symbol: &str) -> Instrument {
    let base = symbol.strip_suffix("USDT").unwrap_or(symbol).to_string();
    Instrument {
        market_id: symbol.to_string(),
        symbol: symbol.to_string(),
        base,
        quote: "USDT".to_string(),
        kind: MarketKind::Spot,
        tick_size: 0.01,
        step_size: 0.0001,
        min_qty: 0.0001,
        max_qty: 1.0e6,
        min_notional: 10.0,
        maker_fee: 0.001,
        taker_fee: 0.001,
        vol24h_quote: 1.0e9,
        last_price: 100.0,
        spread: 0.05,
        buy_sell_enabled: true,
        trader_quantity: 100.0,
    }
}

/// One line of a MERIDIAN_TICKS replay file.
#[derive(Debug, Deserialize)]
struct ReplayTick {
    symbol: String,
    timestamp: f64,
    price: f64,
    #[serde(default)]
    volume: f64,
}

/// Feed a JSONL replay file into the per-symbol tick queues.
fn replay_file(path: &str, feeds: &HashMap<String, Sender<Tick>>) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tick replay file {path}"))?;

    let mut fed = 0;
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let tick: ReplayTick = serde_json::from_str(line)
            .with_context(|| format!("malformed tick at {path}:{}", number + 1))?;

        match feeds.get(&tick.symbol) {
            Some(feed) => {
                // blocking send respects the bounded queue
                if feed
                    .send(Tick::new(tick.timestamp, tick.price, tick.volume))
                    .is_err()
                {
                    warn!(symbol = %tick.symbol, "tick feed closed, replay aborted");
                    break;
                }
                fed += 1;
            }
            None => warn!(symbol = %tick.symbol, "tick for unconfigured symbol skipped"),
        }
    }

    Ok(fed)
}

/// Deterministic random-walk session: three days of one-minute ticks per
/// symbol, ending at the current wall-clock so timeout arithmetic behaves.
fn synthetic_session(feeds: &HashMap<String, Sender<Tick>>) -> usize {
    const STEPS: usize = 3 * 24 * 60;

    let end = chrono::Utc::now().timestamp() as f64;
    let start = end - (STEPS as f64) * 60.0;

    let mut fed = 0;
    for (symbol, feed) in feeds {
        // per-symbol phase offset so the walks differ
        let phase = symbol.bytes().map(f64::from).sum::<f64>() % 7.0;

        for i in 0..STEPS {
            let t = start + i as f64 * 60.0;
            let x = i as f64;
            let price = 100.0
                * (1.0 + 0.04 * (x * 0.011 + phase).sin() + 0.015 * (x * 0.173 + phase).cos());
            if feed.send(Tick::new(t, price, 1.0)).is_err() {
                warn!(symbol = %symbol, "tick feed closed");
                break;
            }
            fed += 1;
        }
    }

    fed
}
