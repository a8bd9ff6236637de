// =============================================================================
// Price Feed: static fallback table or live bookTicker stream
// =============================================================================
//
// The feed owns the subscribed symbol set and pushes every quote it receives
// into a `QuoteSink`. The live stream is one combined websocket for all
// symbols; subscribing a new symbol wakes the stream so it returns and the
// caller reconnects with the enlarged set.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::runtime_config::StaticQuote;
use crate::types::now_ms;

use super::parse_decimal_field;

/// Receiver of raw quotes. Implemented by the application container, which
/// fans them out onto the event bus.
pub trait QuoteSink: Send + Sync {
    fn on_quote(&self, symbol: &str, bid: f64, ask: f64, time_ms: i64);
}

/// Subscribed symbol set plus the drivers that feed it.
pub struct PriceFeed {
    symbols: RwLock<BTreeSet<String>>,
    changed: Notify,
}

impl PriceFeed {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            symbols: RwLock::new(
                symbols
                    .into_iter()
                    .map(|s| normalize_symbol(s.as_ref()))
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            changed: Notify::new(),
        }
    }

    /// Add `symbol` to the feed. Returns false if it was already subscribed.
    pub fn subscribe(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return false;
        }
        let added = self.symbols.write().insert(symbol.clone());
        if added {
            info!(symbol = %symbol, "symbol subscribed");
            self.changed.notify_one();
        }
        added
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.symbols.read().contains(&normalize_symbol(symbol))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Static mode
    // -------------------------------------------------------------------------

    /// Push one quote per subscribed symbol found in `table`. Symbols with no
    /// table entry are skipped. Returns the number of quotes emitted.
    pub fn emit_static(
        &self,
        table: &HashMap<String, StaticQuote>,
        sink: &dyn QuoteSink,
        time_ms: i64,
    ) -> usize {
        let mut emitted = 0;
        for symbol in self.symbols() {
            match table.get(&symbol) {
                Some(q) => {
                    sink.on_quote(&symbol, q.bid, q.ask, time_ms);
                    emitted += 1;
                }
                None => debug!(symbol = %symbol, "no static price, skipping"),
            }
        }
        emitted
    }

    /// Replay the static table every `every` until the task is dropped.
    pub async fn run_static(
        &self,
        table: HashMap<String, StaticQuote>,
        every: Duration,
        sink: &dyn QuoteSink,
    ) {
        info!(symbols = table.len(), every_ms = every.as_millis() as u64, "static price feed running");
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            self.emit_static(&table, sink, now_ms());
        }
    }

    // -------------------------------------------------------------------------
    // Live mode
    // -------------------------------------------------------------------------

    /// Connect to the combined bookTicker stream for the current symbol set
    /// and feed quotes into `sink`.
    ///
    /// Returns when the stream ends or the symbol set changes so that the
    /// caller (main.rs) can reconnect.
    pub async fn run_live(&self, base_url: &str, sink: &dyn QuoteSink) -> Result<()> {
        let symbols = self.symbols();
        if symbols.is_empty() {
            debug!("no symbols subscribed, waiting");
            self.changed.notified().await;
            return Ok(());
        }

        let url = stream_url(base_url, &symbols);
        info!(url = %url, count = symbols.len(), "connecting to bookTicker WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to bookTicker WebSocket")?;

        info!("bookTicker WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match parse_book_ticker(&text) {
                        Ok((symbol, bid, ask)) => sink.on_quote(&symbol, bid, ask, now_ms()),
                        Err(e) => warn!(error = %e, "failed to parse bookTicker message"),
                    },
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "bookTicker WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!("bookTicker WebSocket stream ended");
                        return Ok(());
                    }
                },
                _ = self.changed.notified() => {
                    info!("symbol set changed, resubscribing");
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for PriceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceFeed")
            .field("symbols", &*self.symbols.read())
            .finish()
    }
}

pub(crate) fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Combined-stream URL: `<base>/stream?streams=eurusd@bookTicker/...`.
pub fn stream_url(base_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_lowercase()))
        .collect();
    format!(
        "{}/stream?streams={}",
        base_url.trim_end_matches('/'),
        streams.join("/")
    )
}

/// Parse a bookTicker frame, bare or wrapped in the combined-stream envelope.
///
/// Expected shape:
/// ```json
/// { "stream": "eurusd@bookTicker", "data": { "s": "EURUSD", "b": "1.0850", "a": "1.0852" } }
/// ```
pub fn parse_book_ticker(text: &str) -> Result<(String, f64, f64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse bookTicker JSON")?;
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"].as_str().context("missing field s")?.to_ascii_uppercase();
    let bid = parse_decimal_field(&data["b"], "b")?;
    let ask = parse_decimal_field(&data["a"], "a")?;

    Ok((symbol, bid, ask))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
