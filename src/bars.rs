// =============================================================================
// Bar Engine — aggregates ticks into OHLCV bars across a timeframe chain
// =============================================================================
//
// One ring buffer per timeframe holds the most recent `depth` closed bars
// plus a single in-progress bar. The chain is ordered leaf to root; parent
// boundaries are a subset of child boundaries, so each series detects its
// own roll from the raw tick stream and the cascade falls out of the chain
// iteration order.
//
// Gap handling: when one or more boundaries pass without a tick, synthetic
// bars carrying the last close with zero volume fill the holes so that
// indicator lookbacks stay contiguous.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::timeframe::{Timeframe, TimeframeChain};
use crate::types::Tick;

/// A single OHLCV bar. `timestamp` is the aligned open time in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    fn from_tick(timestamp: f64, price: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn synthetic(timestamp: f64, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }

    /// A bar is closed once wall-clock time passed its right edge.
    pub fn is_closed(&self, timeframe: Timeframe, now: f64) -> bool {
        now >= self.timestamp + timeframe.as_f64()
    }
}

// ---------------------------------------------------------------------------
// BarSeries — ring buffer of closed bars plus one in-progress bar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BarSeries {
    timeframe: Timeframe,
    depth: usize,
    closed: VecDeque<Bar>,
    current: Option<Bar>,
}

impl BarSeries {
    pub fn new(timeframe: Timeframe, depth: usize) -> Self {
        Self {
            timeframe,
            depth: depth.max(1),
            closed: VecDeque::with_capacity(depth + 1),
            current: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Feed one tick. Returns true when at least one bar closed.
    ///
    /// Ticks older than the in-progress bucket are dropped (bars must stay
    /// monotonically timestamped); a tick with the same bucket replaces the
    /// running close (later value wins on equal timestamps).
    pub fn ingest(&mut self, tick: &Tick) -> bool {
        let bucket_ts = self.timeframe.align(tick.timestamp);

        let current = match self.current.as_mut() {
            None => {
                self.current = Some(Bar::from_tick(bucket_ts, tick.price, tick.volume));
                return false;
            }
            Some(current) => current,
        };

        if bucket_ts < current.timestamp {
            // late tick from an already closed bucket
            return false;
        }

        if bucket_ts == current.timestamp {
            current.high = current.high.max(tick.price);
            current.low = current.low.min(tick.price);
            current.close = tick.price;
            current.volume += tick.volume;
            return false;
        }

        // Boundary crossed: close the running bar, fill any gap, restart.
        let finished = *current;
        let last_close = finished.close;
        self.push_closed(finished);

        let step = self.timeframe.as_f64();
        let mut hole = finished.timestamp + step;
        while hole < bucket_ts {
            self.push_closed(Bar::synthetic(hole, last_close));
            hole += step;
        }

        self.current = Some(Bar::from_tick(bucket_ts, tick.price, tick.volume));
        true
    }

    fn push_closed(&mut self, bar: Bar) {
        self.closed.push_back(bar);
        while self.closed.len() > self.depth {
            self.closed.pop_front();
        }
    }

    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    pub fn last_closed(&self) -> Option<&Bar> {
        self.closed.back()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// The most recent `count` closed bars, oldest first, optionally with
    /// the in-progress bar appended. This is the window indicators consume.
    pub fn tail(&self, count: usize, include_current: bool) -> Vec<Bar> {
        let start = self.closed.len().saturating_sub(count);
        let mut bars: Vec<Bar> = self.closed.iter().skip(start).copied().collect();
        if include_current {
            if let Some(current) = self.current {
                bars.push(current);
            }
        }
        bars
    }

    /// Close prices of the most recent `count` closed bars, oldest first.
    pub fn closes(&self, count: usize) -> Vec<f64> {
        let start = self.closed.len().saturating_sub(count);
        self.closed.iter().skip(start).map(|b| b.close).collect()
    }
}

// ---------------------------------------------------------------------------
// BarEngine — one series per timeframe of the chain
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BarEngine {
    series: Vec<BarSeries>,
}

impl BarEngine {
    /// `depths` pairs each chain timeframe with its ring depth; timeframes
    /// absent from `depths` use `default_depth`.
    pub fn new(chain: &TimeframeChain, depths: &[(Timeframe, usize)], default_depth: usize) -> Self {
        let series = chain
            .iter()
            .map(|tf| {
                let depth = depths
                    .iter()
                    .find(|(t, _)| *t == tf)
                    .map(|(_, d)| *d)
                    .unwrap_or(default_depth);
                BarSeries::new(tf, depth)
            })
            .collect();
        Self { series }
    }

    /// Feed one tick to every series, leaf to root. Returns the timeframes
    /// that closed a bar, in chain order — bar closes at a timeframe always
    /// precede the indicator updates driven from the returned list.
    pub fn ingest(&mut self, tick: &Tick) -> Vec<Timeframe> {
        let mut closed = Vec::new();
        for series in &mut self.series {
            if series.ingest(tick) {
                closed.push(series.timeframe());
            }
        }
        closed
    }

    pub fn series(&self, timeframe: Timeframe) -> Option<&BarSeries> {
        self.series.iter().find(|s| s.timeframe() == timeframe)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
