// =============================================================================
// Strategy worker — drives one StrategyTrader on its own worker thread
// =============================================================================
//
// pre_update drains the broker event queue, update drains pending ticks
// through the trader's decision routine. Commands toggle activity and the
// snapshot path backs the dump/load persistence tap.

use std::path::PathBuf;

use anyhow::Context;
use serde_json::Value;
use tracing::{info, warn};

use crate::trader::StrategyTrader;
use crate::worker::Runner;

/// Sleep applied when a playing worker has no pending ticks.
const IDLE_SLEEP: std::time::Duration = std::time::Duration::from_millis(10);

pub struct StrategyWorker {
    name: String,
    trader: StrategyTrader,
    snapshot_path: Option<PathBuf>,
}

impl StrategyWorker {
    pub fn new(trader: StrategyTrader, snapshot_path: Option<PathBuf>) -> Self {
        let name = format!("strategy:{}", trader.market_id());
        Self {
            name,
            trader,
            snapshot_path,
        }
    }

    pub fn trader(&self) -> &StrategyTrader {
        &self.trader
    }

    fn write_snapshot(&self) -> anyhow::Result<()> {
        let path = match &self.snapshot_path {
            Some(path) => path,
            None => return Ok(()),
        };

        let dump = self.trader.dump_trades();
        let content =
            serde_json::to_string_pretty(&dump).context("failed to serialise trade snapshot")?;

        // atomic write: tmp sibling then rename
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        info!(worker = %self.name, path = %path.display(), "trade snapshot saved");
        Ok(())
    }
}

impl Runner for StrategyWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_run(&mut self) -> anyhow::Result<()> {
        // restore any previous snapshot before the first tick
        if let Some(path) = &self.snapshot_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read snapshot {}", path.display()))?;
                let data: Value = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
                self.trader.load_trades(&data);
            }
        }

        info!(worker = %self.name, "strategy worker ready");
        Ok(())
    }

    fn post_run(&mut self) -> anyhow::Result<()> {
        self.write_snapshot()
    }

    fn pre_update(&mut self) {
        self.trader.dispatch_events();
    }

    fn update(&mut self) {
        if self.trader.process_pending() == 0 {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    fn command(&mut self, kind: &str, payload: &Value) {
        match kind {
            "activity" => {
                let enabled = payload.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                self.trader.set_activity(enabled);
            }
            other => {
                warn!(worker = %self.name, command = other, "unknown worker command");
            }
        }
    }

    fn sync(&mut self) {
        self.trader.invalidate_filter_cache();
    }

    fn dump(&mut self) {
        if let Err(e) = self.write_snapshot() {
            warn!(worker = %self.name, error = %e, "trade snapshot failed");
        }
    }

    fn load(&mut self, data: &Value) {
        self.trader.load_trades(data);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::broker::{Broker, PaperBroker};
    use crate::config::StrategyParams;
    use crate::instrument::{Instrument, MarketKind};
    use crate::notifier::{LogNotifier, Notifier};
    use crate::types::Tick;
    use crate::worker::Worker;

    fn market() -> Instrument {
        Instrument {
            market_id: "BTCUSDT".into(),
            symbol: "BTCUSDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            kind: MarketKind::Spot,
            tick_size: 0.01,
            step_size: 0.0001,
            min_qty: 0.0001,
            max_qty: 1000.0,
            min_notional: 10.0,
            maker_fee: 0.001,
            taker_fee: 0.001,
            vol24h_quote: 1.0e9,
            last_price: 100.0,
            spread: 0.1,
            buy_sell_enabled: true,
            trader_quantity: 100.0,
        }
    }

    fn build_worker(snapshot: Option<PathBuf>) -> StrategyWorker {
        let broker = Arc::new(PaperBroker::new());
        broker.add_market(market());
        broker.deposit("USDT", 1_000.0);

        let trader = StrategyTrader::new(
            "BTCUSDT",
            StrategyParams::default(),
            broker as Arc<dyn Broker>,
            Arc::new(LogNotifier) as Arc<dyn Notifier>,
        )
        .unwrap();

        StrategyWorker::new(trader, snapshot)
    }

    #[test]
    fn ticks_flow_through_the_update_hooks() {
        let mut worker = build_worker(None);
        let ticks = worker.trader().tick_sender();

        for i in 0..10 {
            ticks.send(Tick::new(i as f64 * 60.0, 100.0 + i as f64, 1.0)).unwrap();
        }

        worker.pre_update();
        worker.update();

        // the queue is drained even though no signal fired yet
        assert_eq!(worker.trader().trade_count(), 0);
        worker.update(); // idles without ticks
    }

    #[test]
    fn activity_command_toggles_the_trader() {
        let mut worker = build_worker(None);
        worker.command("activity", &serde_json::json!({ "enabled": false }));
        worker.command("unknown-command", &Value::Null);
        // sync resets the market filter cache without panicking
        worker.sync();
    }

    #[test]
    fn snapshot_roundtrip_through_dump_and_pre_run() {
        let dir = std::env::temp_dir().join("meridian-worker-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.json");
        let _ = std::fs::remove_file(&path);

        let mut worker = build_worker(Some(path.clone()));
        worker.dump();
        assert!(path.exists());

        // a fresh worker restores from the same snapshot on startup
        let mut restored = build_worker(Some(path.clone()));
        restored.pre_run().unwrap();

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn runs_on_a_worker_thread() {
        let worker = build_worker(None);
        let ticks = worker.trader().tick_sender();

        let handle = Worker::start(worker, true).unwrap();

        for i in 0..5 {
            ticks.send(Tick::new(i as f64 * 60.0, 100.0, 1.0)).unwrap();
        }
        handle.ping();
        std::thread::sleep(std::time::Duration::from_millis(100));

        assert!(handle.is_running());
        handle.join();
    }
}
