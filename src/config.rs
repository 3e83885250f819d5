// =============================================================================
// Engine Configuration — per-strategy settings with atomic save
// =============================================================================
//
// Every tunable parameter of the strategy execution core lives here. All
// fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash.
//
// The configuration is an immutable value passed at worker construction;
// there is no process-wide singleton.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::timeframe::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_base_timeframe() -> Timeframe {
    Timeframe::T1M
}

fn default_ref_timeframe() -> Timeframe {
    Timeframe::T4H
}

fn default_tp_timeframe() -> Timeframe {
    Timeframe::T1H
}

fn default_max_trades() -> usize {
    3
}

fn default_trade_delay() -> f64 {
    30.0
}

fn default_min_price() -> f64 {
    0.000_000_01
}

fn default_min_vol24h() -> f64 {
    100.0
}

fn default_min_traded_timeframe() -> Timeframe {
    Timeframe::T1M
}

fn default_max_traded_timeframe() -> Timeframe {
    Timeframe::T4H
}

fn default_entry_validity_factor() -> f64 {
    4.0
}

fn default_atr_stop_multiplier() -> f64 {
    1.5
}

fn default_history_depth() -> usize {
    100
}

fn default_timeframes() -> Vec<TimeframeParams> {
    vec![
        TimeframeParams {
            timeframe: Timeframe::T1M,
            mode: SubStrategyMode::A,
            depth: default_history_depth(),
        },
        TimeframeParams {
            timeframe: Timeframe::T15M,
            mode: SubStrategyMode::A,
            depth: default_history_depth(),
        },
        TimeframeParams {
            timeframe: Timeframe::T1H,
            mode: SubStrategyMode::B,
            depth: default_history_depth(),
        },
        TimeframeParams {
            timeframe: Timeframe::T4H,
            mode: SubStrategyMode::C,
            depth: default_history_depth(),
        },
    ]
}

fn default_quote_budget() -> f64 {
    100.0
}

// =============================================================================
// Per-timeframe sub-strategy parameters
// =============================================================================

/// Which candidate-signal rules a timeframe analyser runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubStrategyMode {
    A,
    B,
    C,
}

/// One entry per analysed timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeParams {
    pub timeframe: Timeframe,
    pub mode: SubStrategyMode,
    /// Bars retained in the ring buffer, sized to the largest lookback.
    #[serde(default = "default_history_depth")]
    pub depth: usize,
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Per-strategy tunables consumed by the strategy trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StrategyParams {
    /// Smallest timeframe; aggregates ticks into bars.
    #[serde(default = "default_base_timeframe")]
    pub base_timeframe: Timeframe,

    /// Timeframe used for the global trend indicators.
    #[serde(default = "default_ref_timeframe")]
    pub ref_timeframe: Timeframe,

    /// Timeframe whose pivot resistances supply profit targets.
    #[serde(default = "default_tp_timeframe")]
    pub tp_timeframe: Timeframe,

    /// Recompute indicators even without a new closed bar.
    #[serde(default)]
    pub need_update: bool,

    /// Maximum simultaneous trades per instrument.
    #[serde(default = "default_max_trades")]
    pub max_trades: usize,

    /// Minimum delay in seconds between two entries (reserved; the
    /// same-direction suppression additionally uses the signal timeframe).
    #[serde(default = "default_trade_delay")]
    pub trade_delay: f64,

    /// Markets below this last price are accepted but not computed.
    #[serde(default = "default_min_price")]
    pub min_price: f64,

    /// Markets below this 24h quote volume are accepted but not computed.
    #[serde(default = "default_min_vol24h")]
    pub min_vol24h: f64,

    /// Only signals within this timeframe range may open trades.
    #[serde(default = "default_min_traded_timeframe")]
    pub min_traded_timeframe: Timeframe,
    #[serde(default = "default_max_traded_timeframe")]
    pub max_traded_timeframe: Timeframe,

    /// Accept entries when no trade region is configured.
    #[serde(default = "default_true")]
    pub region_allow: bool,

    /// Validity window of a partially filled entry, as a multiple of the
    /// trade's timeframe.
    #[serde(default = "default_entry_validity_factor")]
    pub entry_validity_factor: f64,

    /// ATR multiplier for derived stop-loss distances.
    #[serde(default = "default_atr_stop_multiplier")]
    pub atr_stop_multiplier: f64,

    /// Quote-currency budget committed per entry order.
    #[serde(default = "default_quote_budget")]
    pub quote_budget: f64,

    /// Analysed timeframes, one sub-strategy each.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<TimeframeParams>,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            base_timeframe: default_base_timeframe(),
            ref_timeframe: default_ref_timeframe(),
            tp_timeframe: default_tp_timeframe(),
            need_update: false,
            max_trades: default_max_trades(),
            trade_delay: default_trade_delay(),
            min_price: default_min_price(),
            min_vol24h: default_min_vol24h(),
            min_traded_timeframe: default_min_traded_timeframe(),
            max_traded_timeframe: default_max_traded_timeframe(),
            region_allow: true,
            entry_validity_factor: default_entry_validity_factor(),
            atr_stop_multiplier: default_atr_stop_multiplier(),
            quote_budget: default_quote_budget(),
            timeframes: default_timeframes(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Whether order placement is active. When false the trader still
    /// computes and notifies signals (with `trade_id = -1`).
    #[serde(default = "default_true")]
    pub activity: bool,

    /// Symbols the engine watches and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Retain loop timing samples and report them on ping.
    #[serde(default)]
    pub benchmark: bool,

    #[serde(default)]
    pub strategy: StrategyParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            activity: true,
            symbols: default_symbols(),
            benchmark: false,
            strategy: StrategyParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            activity = config.activity,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
