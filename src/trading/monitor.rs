// =============================================================================
// Sweep Monitor: periodic and price-driven SL/TP + pending-order sweeps
// =============================================================================
//
// Two background loops drive the trade engine:
//
//   run_sweep_monitor        every `sweep_interval_ms`: refresh stale quotes
//                            (live feed only), then sweep every symbol.
//   run_price_driven_sweeps  on each `price:update`: sweep that symbol only.
//                            Updates that queue up while a sweep runs are
//                            coalesced to one sweep per symbol.
//
// Both are spawned once at startup from main.rs.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::events::{Event, Subscription};

use super::engine::{SweepReport, TradeEngine};

/// Results of one SL/TP sweep and one pending-order sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub sltp: SweepReport,
    pub pending: SweepReport,
}

/// Run both sweeps across all symbols.
pub fn run_sweeps(engine: &TradeEngine) -> SweepSummary {
    SweepSummary {
        sltp: engine.check_sltp(),
        pending: engine.check_pending_orders(),
    }
}

/// Run both sweeps for a single symbol.
pub fn run_sweeps_for(engine: &TradeEngine, symbol: &str) -> SweepSummary {
    SweepSummary {
        sltp: engine.check_sltp_for(symbol),
        pending: engine.check_pending_orders_for(symbol),
    }
}

/// Periodic sweep loop. Runs forever; spawn it as a background task.
pub async fn run_sweep_monitor(state: Arc<AppState>) {
    let every = state.runtime_config.read().sweep_interval();
    info!(interval_ms = every.as_millis() as u64, "sweep monitor started");

    let mut ticker = interval(every);
    loop {
        ticker.tick().await;

        let refreshed = state.refresh_stale_quotes().await;
        if refreshed > 0 {
            debug!(refreshed, "stale quotes refreshed before sweep");
        }

        run_sweeps(&state.engine);
    }
}

/// Sweep each symbol as its price updates. Returns when the bus is gone.
pub async fn run_price_driven_sweeps(engine: Arc<TradeEngine>, mut updates: Subscription) {
    info!("price-driven sweeps started");

    while let Some(event) = updates.recv().await {
        let mut symbols = BTreeSet::new();
        collect_symbol(&event, &mut symbols);
        while let Some(event) = updates.try_recv() {
            collect_symbol(&event, &mut symbols);
        }

        for symbol in &symbols {
            run_sweeps_for(&engine, symbol);
        }
    }

    info!("price-driven sweeps stopped: event bus closed");
}

fn collect_symbol(event: &Event, symbols: &mut BTreeSet<String>) {
    if let Event::PriceUpdate(update) = event {
        symbols.insert(update.symbol.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventKind};
    use crate::market_data::InstrumentStore;
    use crate::trading::{MemoryRepository, OpenTradeRequest, TradingLimits};
    use crate::types::{PriceUpdate, Side, TradeStatus};

    fn update(bid: f64, ask: f64) -> PriceUpdate {
        PriceUpdate {
            symbol: "EURUSD".into(),
            bid,
            ask,
            spread: ask - bid,
            time: 0,
        }
    }

    #[tokio::test]
    async fn price_updates_drive_stop_loss() {
        let bus = EventBus::default();
        let store = Arc::new(InstrumentStore::default());
        {
            let store = store.clone();
            bus.on(EventKind::PriceUpdate, move |event| {
                if let Event::PriceUpdate(u) = event {
                    store.on_price_update(u);
                }
            });
        }
        let engine = Arc::new(TradeEngine::new(
            Arc::new(MemoryRepository::new()),
            store,
            bus.clone(),
            TradingLimits::default(),
        ));
        let mut closed = bus.subscribe(EventKind::TradeClosed);
        let task = tokio::spawn(run_price_driven_sweeps(
            engine.clone(),
            bus.subscribe(EventKind::PriceUpdate),
        ));

        bus.publish(Event::PriceUpdate(update(1.1000, 1.1002)));
        engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = engine
            .create_trade(OpenTradeRequest {
                user_id: "u1".into(),
                symbol: "EURUSD".into(),
                side: Side::Buy,
                lot: 1.0,
                leverage: None,
                stop_loss: Some(1.0960),
                take_profit: None,
            })
            .unwrap();

        bus.publish(Event::PriceUpdate(update(1.0950, 1.0952)));

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.trade().map(|t| t.id.as_str()), Some(trade.id.as_str()));
        assert_eq!(engine.trade("u1", &trade.id).unwrap().status, TradeStatus::Closed);

        task.abort();
    }

    #[test]
    fn run_sweeps_reports_both_sweeps() {
        let engine = TradeEngine::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(InstrumentStore::default()),
            EventBus::default(),
            TradingLimits::default(),
        );
        assert_eq!(run_sweeps(&engine), SweepSummary::default());
        assert_eq!(run_sweeps_for(&engine, "EURUSD"), SweepSummary::default());
    }
}
