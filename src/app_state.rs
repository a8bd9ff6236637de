// =============================================================================
// Central Application State: B-book engine container
// =============================================================================
//
// Explicitly constructed, never global: every test builds its own. `new`
// wires the event bus to its in-process consumers:
//
//   price:update  ->  InstrumentStore        (inline handler)
//   tick          ->  CandleBuilder          (inline handler)
//   candle:update <-  CandleBuilder on bar close
//   trade:*       <-  TradeEngine
//
// Async consumers (sweeps, websocket clients) take channel subscriptions.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::events::{Event, EventBus, EventKind};
use crate::market_data::price_feed::normalize_symbol;
use crate::market_data::{
    Candle, CandleBuilder, InstrumentStatus, InstrumentStore, PriceFeed, QuoteClient, QuoteSink,
    Timeframe,
};
use crate::runtime_config::{FeedMode, RuntimeConfig};
use crate::trading::{Repository, TradeEngine, TradingLimits};
use crate::types::{PriceUpdate, Quote, Tick};

/// Shared state handed to every background task and HTTP handler via
/// `Arc<AppState>`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub bus: EventBus,
    pub store: Arc<InstrumentStore>,
    pub candles: Arc<CandleBuilder>,
    pub engine: Arc<TradeEngine>,
    pub feed: Arc<PriceFeed>,
    /// REST refresher for stale quotes; live feed mode only.
    pub quote_client: Option<QuoteClient>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, repository: Arc<dyn Repository>) -> Result<Self> {
        let bus = EventBus::new(config.max_subscribers);

        let store = Arc::new(InstrumentStore::new(config.stale_after()));
        {
            let store = store.clone();
            bus.on(EventKind::PriceUpdate, move |event| {
                if let Event::PriceUpdate(update) = event {
                    store.on_price_update(update);
                }
            });
        }

        // The builder publishes on the bus, so the bus only holds a weak
        // reference back to it.
        let candles = Arc::new(CandleBuilder::with_bus(config.candle_history, bus.clone()));
        {
            let candles = Arc::downgrade(&candles);
            bus.on(EventKind::Tick, move |event| {
                if let (Event::Tick(tick), Some(candles)) = (event, candles.upgrade()) {
                    candles.on_tick(tick);
                }
            });
        }

        let limits = TradingLimits {
            min_lot: config.min_lot,
            max_lot: config.max_lot,
            default_leverage: config.default_leverage,
            max_leverage: config.max_leverage,
        };
        let engine = Arc::new(TradeEngine::new(repository, store.clone(), bus.clone(), limits));

        let feed = Arc::new(PriceFeed::new(&config.symbols));

        let quote_client = match config.feed_mode {
            FeedMode::Live => Some(QuoteClient::new(&config.quote_url, config.quote_timeout())?),
            FeedMode::Static => None,
        };

        info!(
            symbols = config.symbols.len(),
            feed_mode = %config.feed_mode,
            candle_history = config.candle_history,
            "application state initialised"
        );

        Ok(Self {
            runtime_config: Arc::new(RwLock::new(config)),
            bus,
            store,
            candles,
            engine,
            feed,
            quote_client,
            started_at: Instant::now(),
        })
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Add `symbol` to the feed and to the persisted symbol list.
    pub fn subscribe_symbol(&self, symbol: &str) -> bool {
        let added = self.feed.subscribe(symbol);
        if added {
            let symbol = normalize_symbol(symbol);
            let mut config = self.runtime_config.write();
            if !config.symbols.contains(&symbol) {
                config.symbols.push(symbol);
            }
        }
        added
    }

    pub fn get_price(&self, symbol: &str) -> Option<Quote> {
        self.store.get_price(symbol)
    }

    pub fn instrument_status(&self, symbol: &str) -> InstrumentStatus {
        self.store.get_instrument_with_status(symbol)
    }

    pub fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Vec<Candle> {
        self.candles.get_candles(symbol, timeframe, limit)
    }

    pub fn get_current_candle(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        self.candles.get_current_candle(symbol, timeframe)
    }

    /// Refetch every subscribed symbol whose quote has gone stale. Returns
    /// the number refreshed; always 0 without a quote client.
    pub async fn refresh_stale_quotes(&self) -> usize {
        let Some(client) = &self.quote_client else {
            return 0;
        };
        let stale: Vec<String> = self
            .feed
            .symbols()
            .into_iter()
            .filter(|s| self.store.is_stale(s))
            .collect();
        if stale.is_empty() {
            return 0;
        }
        debug!(symbols = ?stale, "refreshing stale quotes");
        client.refresh(&stale, self).await
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl QuoteSink for AppState {
    /// Fan a raw quote out as `price:update`, then as a `tick` at the bid.
    fn on_quote(&self, symbol: &str, bid: f64, ask: f64, time_ms: i64) {
        self.bus.publish(Event::PriceUpdate(PriceUpdate {
            symbol: symbol.to_string(),
            bid,
            ask,
            spread: ask - bid,
            time: time_ms,
        }));
        self.bus.publish(Event::Tick(Tick {
            symbol: symbol.to_string(),
            price: bid,
            time: time_ms,
        }));
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.store)
            .field("candles", &self.candles)
            .field("engine", &self.engine)
            .field("feed", &self.feed)
            .field("quote_client", &self.quote_client)
            .finish()
    }
}
