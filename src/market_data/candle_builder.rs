// =============================================================================
// Candle Builder: tick-to-OHLC aggregation across seven fixed timeframes
// =============================================================================
//
// Per symbol, one table with a fixed slot per timeframe (indexed by
// `Timeframe::index`), so the tick path never builds string keys. Each slot
// holds the in-flight candle and a ring of closed candles trimmed to
// `history_limit`, oldest evicted first.
//
// A tick whose bucket differs from the in-flight one closes it (history push
// + `candle:update`) and opens a fresh candle. Empty buckets in a gap are not
// synthesised. Ticks that land in a bucket older than the in-flight candle are
// ignored for that timeframe, so closed history stays in time order.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::types::Tick;

/// Default number of closed candles retained per (symbol, timeframe).
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    pub fn duration_ms(self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::M1 => MINUTE,
            Self::M5 => 5 * MINUTE,
            Self::M15 => 15 * MINUTE,
            Self::M30 => 30 * MINUTE,
            Self::H1 => 60 * MINUTE,
            Self::H4 => 240 * MINUTE,
            Self::D1 => 1_440 * MINUTE,
        }
    }

    /// Slot position in the per-symbol table.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Timeframe-aligned bucket start containing `time_ms`.
    pub fn bucket_start(self, time_ms: i64) -> i64 {
        let d = self.duration_ms();
        time_ms.div_euclid(d) * d
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown timeframe '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One OHLC bar. `volume` counts ticks, not traded size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub start_time: i64,
    pub volume: u64,
}

impl Candle {
    fn open_at(symbol: &str, timeframe: Timeframe, start_time: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            open: price,
            high: price,
            low: price,
            close: price,
            start_time,
            volume: 1,
        }
    }

    fn apply(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += 1;
    }
}

// ---------------------------------------------------------------------------
// Per-symbol series table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Series {
    current: Option<Candle>,
    closed: VecDeque<Candle>,
}

struct SymbolSeries {
    slots: [Series; 7],
}

impl SymbolSeries {
    fn new() -> Self {
        Self {
            slots: Default::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// CandleBuilder
// ---------------------------------------------------------------------------

/// Aggregates ticks into candles for every timeframe in [`Timeframe::ALL`].
pub struct CandleBuilder {
    symbols: RwLock<HashMap<String, Arc<Mutex<SymbolSeries>>>>,
    history_limit: usize,
    bus: Option<EventBus>,
}

impl CandleBuilder {
    /// Builder that keeps `history_limit` closed candles per series and does
    /// not publish anything.
    pub fn new(history_limit: usize) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            history_limit,
            bus: None,
        }
    }

    /// Builder that publishes `candle:update` on `bus` for every closed candle.
    pub fn with_bus(history_limit: usize, bus: EventBus) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new(history_limit)
        }
    }

    fn series(&self, symbol: &str) -> Option<Arc<Mutex<SymbolSeries>>> {
        self.symbols.read().get(symbol).cloned()
    }

    fn series_or_insert(&self, symbol: &str) -> Arc<Mutex<SymbolSeries>> {
        if let Some(series) = self.series(symbol) {
            return series;
        }
        self.symbols
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolSeries::new())))
            .clone()
    }

    /// Fold one tick into every timeframe. Returns the candles it closed.
    pub fn on_tick(&self, tick: &Tick) -> Vec<Candle> {
        if !tick.price.is_finite() {
            warn!(symbol = %tick.symbol, price = tick.price, "non-finite tick dropped");
            return Vec::new();
        }

        let series = self.series_or_insert(&tick.symbol);
        let mut closed = Vec::new();
        {
            let mut table = series.lock();
            for tf in Timeframe::ALL {
                let bucket = tf.bucket_start(tick.time);
                let slot = &mut table.slots[tf.index()];

                match slot.current.as_mut() {
                    Some(current) if current.start_time == bucket => current.apply(tick.price),
                    Some(current) if bucket < current.start_time => {
                        debug!(
                            symbol = %tick.symbol,
                            timeframe = %tf,
                            tick_time = tick.time,
                            bucket_start = current.start_time,
                            "late tick ignored"
                        );
                    }
                    _ => {
                        let fresh = Candle::open_at(&tick.symbol, tf, bucket, tick.price);
                        if let Some(done) = slot.current.replace(fresh) {
                            slot.closed.push_back(done.clone());
                            while slot.closed.len() > self.history_limit {
                                slot.closed.pop_front();
                            }
                            closed.push(done);
                        }
                    }
                }
            }
        }

        for candle in &closed {
            debug!(
                symbol = %candle.symbol,
                timeframe = %candle.timeframe,
                start_time = candle.start_time,
                close = candle.close,
                volume = candle.volume,
                "candle closed"
            );
            if let Some(bus) = &self.bus {
                bus.publish(Event::CandleUpdate(candle.clone()));
            }
        }

        closed
    }

    /// Most recent `limit` closed candles, oldest first.
    pub fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Vec<Candle> {
        let Some(series) = self.series(symbol) else {
            return Vec::new();
        };
        let table = series.lock();
        let closed = &table.slots[timeframe.index()].closed;
        let start = closed.len().saturating_sub(limit);
        closed.iter().skip(start).cloned().collect()
    }

    /// The in-flight candle, if any tick has been seen.
    pub fn get_current_candle(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        let series = self.series(symbol)?;
        let table = series.lock();
        table.slots[timeframe.index()].current.clone()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }
}

impl Default for CandleBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl std::fmt::Debug for CandleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleBuilder")
            .field("symbols", &self.symbols.read().len())
            .field("history_limit", &self.history_limit)
            .field("publishes", &self.bus.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
