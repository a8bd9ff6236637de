// =============================================================================
// Runtime Configuration: engine settings with atomic save
// =============================================================================
//
// Every tunable the engine reads at startup lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so adding a field never breaks loading an older file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "EURUSD".to_string(),
        "GBPUSD".to_string(),
        "USDJPY".to_string(),
        "XAUUSD".to_string(),
        "BTCUSD".to_string(),
    ]
}

fn default_feed_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_quote_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_quote_timeout_ms() -> u64 {
    1_500
}

fn default_static_prices() -> HashMap<String, StaticQuote> {
    [
        ("EURUSD", 1.0850, 1.0852),
        ("GBPUSD", 1.2650, 1.2653),
        ("USDJPY", 149.50, 149.53),
        ("XAUUSD", 2350.00, 2350.50),
        ("BTCUSD", 65000.0, 65010.0),
    ]
    .into_iter()
    .map(|(symbol, bid, ask)| (symbol.to_string(), StaticQuote { bid, ask }))
    .collect()
}

fn default_static_tick_ms() -> u64 {
    1_000
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_candle_history() -> usize {
    500
}

fn default_max_subscribers() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_leverage() -> u32 {
    100
}

fn default_max_leverage() -> u32 {
    500
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_max_lot() -> f64 {
    100.0
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// Feed settings
// =============================================================================

/// Where quotes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Replay the `static_prices` table on a fixed interval.
    #[default]
    Static,
    /// Stream bookTicker quotes from `feed_url`.
    Live,
}

impl std::fmt::Display for FeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for FeedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "live" => Ok(Self::Live),
            other => Err(format!("invalid feed mode '{other}'")),
        }
    }
}

/// One row of the static fallback price table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StaticQuote {
    pub bid: f64,
    pub ask: f64,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market data --------------------------------------------------------

    /// Symbols subscribed at startup. More can be added at runtime.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub feed_mode: FeedMode,

    /// Base URL of the websocket quote stream (live mode).
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Base URL of the REST quote endpoint used to refresh stale symbols.
    #[serde(default = "default_quote_url")]
    pub quote_url: String,

    /// Hard timeout for a single REST quote fetch.
    #[serde(default = "default_quote_timeout_ms")]
    pub quote_timeout_ms: u64,

    /// Fallback bid/ask per symbol (static mode).
    #[serde(default = "default_static_prices")]
    pub static_prices: HashMap<String, StaticQuote>,

    #[serde(default = "default_static_tick_ms")]
    pub static_tick_ms: u64,

    /// A quote with no update for this long is stale.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Closed candles retained per (symbol, timeframe).
    #[serde(default = "default_candle_history")]
    pub candle_history: usize,

    /// Per-event subscriber count beyond which the bus logs a configuration
    /// error.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    // --- Sweeps -------------------------------------------------------------

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Also sweep a symbol every time its price updates.
    #[serde(default = "default_true")]
    pub event_driven_sweeps: bool,

    // --- Trading limits -----------------------------------------------------

    /// Leverage applied when a request does not specify one.
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    #[serde(default = "default_min_lot")]
    pub min_lot: f64,

    #[serde(default = "default_max_lot")]
    pub max_lot: f64,

    // --- Service ------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            feed_mode: FeedMode::Static,
            feed_url: default_feed_url(),
            quote_url: default_quote_url(),
            quote_timeout_ms: default_quote_timeout_ms(),
            static_prices: default_static_prices(),
            static_tick_ms: default_static_tick_ms(),
            stale_after_ms: default_stale_after_ms(),
            candle_history: default_candle_history(),
            max_subscribers: default_max_subscribers(),
            sweep_interval_ms: default_sweep_interval_ms(),
            event_driven_sweeps: true,
            default_leverage: default_leverage(),
            max_leverage: default_max_leverage(),
            min_lot: default_min_lot(),
            max_lot: default_max_lot(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            feed_mode = %config.feed_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `ENGINE_SYMBOLS`, `ENGINE_BIND_ADDR` and `ENGINE_FEED_MODE`
    /// overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(syms) = lookup("ENGINE_SYMBOLS") {
            self.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(addr) = lookup("ENGINE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(mode) = lookup("ENGINE_FEED_MODE") {
            match mode.parse() {
                Ok(mode) => self.feed_mode = mode,
                Err(e) => warn!(error = %e, "ignoring ENGINE_FEED_MODE override"),
            }
        }
        if self.symbols.is_empty() {
            self.symbols = default_symbols();
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn static_tick(&self) -> Duration {
        Duration::from_millis(self.static_tick_ms.max(1))
    }
}
