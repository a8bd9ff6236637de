// =============================================================================
// Instrument Store: latest quote per symbol with staleness tracking
// =============================================================================
//
// One slot per symbol, each behind its own lock; the outer map is only
// write-locked the first time a symbol is seen. Slots are never removed:
// a silent feed shows up as staleness, and the last bid/ask stays readable.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{PriceUpdate, Quote};

/// Quotes older than this (wall clock) are considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Cached quote for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    /// Feed time of the last update, milliseconds since the UNIX epoch.
    pub time: i64,
}

impl Instrument {
    pub fn quote(&self) -> Quote {
        Quote {
            bid: self.bid,
            ask: self.ask,
        }
    }
}

/// Instrument plus its live flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentStatus {
    pub instrument: Option<Instrument>,
    pub is_live: bool,
}

struct Slot {
    instrument: Instrument,
    seen_at: Instant,
}

/// Thread-safe cache of the latest quote per symbol.
pub struct InstrumentStore {
    slots: RwLock<HashMap<String, Arc<RwLock<Slot>>>>,
    stale_after: Duration,
}

impl InstrumentStore {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    /// Upsert the cached quote. Zero or odd prices are stored as-is;
    /// filtering is the feed's job.
    pub fn on_price_update(&self, update: &PriceUpdate) {
        let instrument = Instrument {
            symbol: update.symbol.clone(),
            bid: update.bid,
            ask: update.ask,
            spread: update.spread,
            time: update.time,
        };
        let now = Instant::now();

        let existing = self.slots.read().get(&update.symbol).cloned();
        match existing {
            Some(slot) => {
                let mut slot = slot.write();
                slot.instrument = instrument;
                slot.seen_at = now;
            }
            None => {
                debug!(symbol = %update.symbol, "first quote for symbol");
                let mut map = self.slots.write();
                let slot = map.entry(update.symbol.clone()).or_insert_with(|| {
                    Arc::new(RwLock::new(Slot {
                        instrument: instrument.clone(),
                        seen_at: now,
                    }))
                });
                let mut slot = slot.write();
                slot.instrument = instrument;
                slot.seen_at = now;
            }
        }
    }

    fn slot(&self, symbol: &str) -> Option<Arc<RwLock<Slot>>> {
        self.slots.read().get(symbol).cloned()
    }

    pub fn get_instrument(&self, symbol: &str) -> Option<Instrument> {
        self.slot(symbol).map(|s| s.read().instrument.clone())
    }

    /// True if the symbol was never seen or has not updated within the
    /// staleness window.
    pub fn is_stale(&self, symbol: &str) -> bool {
        match self.slot(symbol) {
            Some(slot) => slot.read().seen_at.elapsed() >= self.stale_after,
            None => true,
        }
    }

    pub fn get_instrument_with_status(&self, symbol: &str) -> InstrumentStatus {
        match self.slot(symbol) {
            Some(slot) => {
                let slot = slot.read();
                InstrumentStatus {
                    instrument: Some(slot.instrument.clone()),
                    is_live: slot.seen_at.elapsed() < self.stale_after,
                }
            }
            None => InstrumentStatus {
                instrument: None,
                is_live: false,
            },
        }
    }

    /// Last known bid/ask, live or not.
    pub fn get_price(&self, symbol: &str) -> Option<Quote> {
        self.get_instrument(symbol).map(|i| i.quote())
    }

    /// Bid/ask usable for trading: fresh and strictly positive on both sides.
    pub fn live_quote(&self, symbol: &str) -> Option<Quote> {
        let status = self.get_instrument_with_status(symbol);
        let instrument = status.instrument?;
        if !status.is_live || !is_tradable(instrument.bid) || !is_tradable(instrument.ask) {
            return None;
        }
        Some(instrument.quote())
    }

    pub fn is_known(&self, symbol: &str) -> bool {
        self.slots.read().contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.slots.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Known symbols whose quote has gone stale.
    pub fn stale_symbols(&self) -> Vec<String> {
        self.symbols()
            .into_iter()
            .filter(|s| self.is_stale(s))
            .collect()
    }
}

fn is_tradable(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

impl Default for InstrumentStore {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl std::fmt::Debug for InstrumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentStore")
            .field("symbols", &self.slots.read().len())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
