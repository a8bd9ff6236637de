// =============================================================================
// Trade Engine: trade lifecycle, SL/TP sweep, pending-order sweep
// =============================================================================
//
// Every operation that touches a user's wallet or records runs inside that
// user's lane (a per-user mutex), and re-reads the record it is about to
// change before changing it. Together these make each realized-PnL credit
// happen at most once: a trade that is no longer active, or an order that is
// no longer pending, is left alone.
//
// Sweeps isolate failures per item. A missing price skips the item, a
// repository error is logged and counted, and the sweep moves on.
//
// Events are published after the lane is released.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calc;
use crate::error::{EngineError, EngineResult, INSUFFICIENT_MARGIN_AT_EXECUTION};
use crate::events::{Event, EventBus};
use crate::market_data::price_feed::normalize_symbol;
use crate::market_data::InstrumentStore;
use crate::types::{CloseReason, OrderStatus, OrderType, Quote, Side, TradeStatus, TradingSession};

use super::models::{PendingOrder, Trade, Wallet, LOT_EPSILON};
use super::repository::Repository;
use super::validation::{self, TradingLimits};

/// Reason recorded on orders the owner cancels.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Number of user lanes. Users hashing to the same lane share it.
const LANE_SHARDS: usize = 64;

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Market order request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTradeRequest {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub lot: f64,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Resting order request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrderRequest {
    pub user_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub lot: f64,
    pub trigger_price: f64,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Replacement values for a pending order. Absent stops or expiry clear them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderChanges {
    pub trigger_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Items checked against a live price.
    pub evaluated: usize,
    /// Trades closed (SL/TP) or orders executed.
    pub triggered: usize,
    /// Items left alone for lack of a usable price.
    pub skipped: usize,
    /// Items whose processing errored.
    pub failed: usize,
    pub expired: usize,
    /// Orders cancelled for insufficient margin at execution.
    pub cancelled: usize,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        self.triggered == 0 && self.failed == 0 && self.expired == 0 && self.cancelled == 0
    }
}

enum OrderOutcome {
    Executed(Trade),
    Cancelled,
    Unchanged,
}

struct TradeTicket<'a> {
    user_id: &'a str,
    symbol: &'a str,
    side: Side,
    lot: f64,
    leverage: u32,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    pending_order_id: Option<String>,
}

// ---------------------------------------------------------------------------
// TradeEngine
// ---------------------------------------------------------------------------

pub struct TradeEngine {
    repo: Arc<dyn Repository>,
    store: Arc<InstrumentStore>,
    bus: EventBus,
    limits: TradingLimits,
    lanes: Box<[Mutex<()>]>,
}

impl TradeEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<InstrumentStore>,
        bus: EventBus,
        limits: TradingLimits,
    ) -> Self {
        Self {
            repo,
            store,
            bus,
            limits,
            lanes: (0..LANE_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn limits(&self) -> TradingLimits {
        self.limits
    }

    /// The serialisation lane for `user_id`. The table is fixed-size, so
    /// unknown ids never allocate.
    fn lane(&self, user_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.lanes[(hasher.finish() as usize) % self.lanes.len()]
    }

    /// A fresh, non-zero quote, or the reason there is none.
    fn tradable_quote(&self, symbol: &str) -> EngineResult<Quote> {
        if !self.store.is_known(symbol) {
            return Err(EngineError::UnknownSymbol(symbol.to_string()));
        }
        self.store
            .live_quote(symbol)
            .ok_or_else(|| EngineError::PriceUnavailable(symbol.to_string()))
    }

    fn load_wallet(&self, user_id: &str) -> EngineResult<Wallet> {
        self.repo
            .wallet(user_id)?
            .ok_or_else(|| EngineError::WalletNotFound(user_id.to_string()))
    }

    fn owned_trade(&self, user_id: &str, trade_id: &str) -> EngineResult<Trade> {
        self.repo
            .trade(trade_id)?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| EngineError::TradeNotFound(trade_id.to_string()))
    }

    fn owned_order(&self, user_id: &str, order_id: &str) -> EngineResult<PendingOrder> {
        self.repo
            .order(order_id)?
            .filter(|o| o.user_id == user_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))
    }

    // -------------------------------------------------------------------------
    // Wallet
    // -------------------------------------------------------------------------

    /// Credit `amount` to the user's wallet, creating it on first deposit.
    pub fn fund_wallet(&self, user_id: &str, amount: f64) -> EngineResult<Wallet> {
        validation::validate_amount(amount)?;

        let lane = self.lane(user_id);
        let _guard = lane.lock();

        let mut wallet = self
            .repo
            .wallet(user_id)?
            .unwrap_or_else(|| Wallet::new(user_id));
        wallet.balance = calc::round_money(wallet.balance + amount);
        let wallet = self.project_locked(wallet)?;

        info!(user_id, amount, balance = wallet.balance, "wallet funded");
        Ok(wallet)
    }

    /// Recompute and persist the wallet projection from current prices.
    pub fn wallet(&self, user_id: &str) -> EngineResult<Wallet> {
        let lane = self.lane(user_id);
        let _guard = lane.lock();
        let wallet = self.load_wallet(user_id)?;
        self.project_locked(wallet)
    }

    /// Mark every active trade of the wallet's owner, then apply the wallet
    /// formulas and save. Trades without a live price keep their last mark.
    fn project_locked(&self, mut wallet: Wallet) -> EngineResult<Wallet> {
        let mut floating = 0.0;
        let mut used_margin = 0.0;

        for mut trade in self
            .repo
            .user_trades(&wallet.user_id)?
            .into_iter()
            .filter(Trade::is_active)
        {
            if let Some(q) = self.store.live_quote(&trade.symbol) {
                let marked = trade.mark(q.bid, q.ask);
                if marked != trade.floating_pnl {
                    trade.floating_pnl = marked;
                    self.repo.save_trade(&trade)?;
                }
            }
            floating += trade.floating_pnl;
            used_margin += trade.margin;
        }

        wallet.apply(calc::project_wallet(wallet.balance, floating, used_margin));
        self.repo.save_wallet(&wallet)?;
        Ok(wallet)
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Open a market position at ask (BUY) or bid (SELL).
    pub fn create_trade(&self, req: OpenTradeRequest) -> EngineResult<Trade> {
        self.limits.validate_lot(req.lot)?;
        let leverage = self.limits.resolve_leverage(req.leverage)?;
        let symbol = normalize_symbol(&req.symbol);
        let quote = self.tradable_quote(&symbol)?;
        let entry = calc::entry_price(req.side, quote.bid, quote.ask);
        validation::validate_stops(req.side, entry, req.stop_loss, req.take_profit)?;
        let margin = calc::margin(req.lot, entry, calc::contract_size(&symbol), leverage as f64);

        let trade = {
            let lane = self.lane(&req.user_id);
            let _guard = lane.lock();

            let wallet = self.project_locked(self.load_wallet(&req.user_id)?)?;
            if margin > wallet.free_margin {
                return Err(EngineError::InsufficientMargin {
                    required: margin,
                    free: wallet.free_margin,
                });
            }

            let ticket = TradeTicket {
                user_id: &req.user_id,
                symbol: &symbol,
                side: req.side,
                lot: req.lot,
                leverage,
                stop_loss: req.stop_loss,
                take_profit: req.take_profit,
                pending_order_id: None,
            };
            self.open_locked(ticket, quote, Uuid::new_v4().to_string(), Utc::now())?
        };

        self.bus.publish(Event::TradeOpened(trade.clone()));
        Ok(trade)
    }

    fn open_locked(
        &self,
        ticket: TradeTicket<'_>,
        quote: Quote,
        id: String,
        now: DateTime<Utc>,
    ) -> EngineResult<Trade> {
        let entry_price = calc::entry_price(ticket.side, quote.bid, quote.ask);
        let contract_size = calc::contract_size(ticket.symbol);
        let margin = calc::margin(ticket.lot, entry_price, contract_size, ticket.leverage as f64);

        let mut trade = Trade {
            id,
            user_id: ticket.user_id.to_string(),
            symbol: ticket.symbol.to_string(),
            side: ticket.side,
            lot: ticket.lot,
            entry_price,
            stop_loss: ticket.stop_loss,
            take_profit: ticket.take_profit,
            status: TradeStatus::Open,
            floating_pnl: 0.0,
            realized_pnl: 0.0,
            margin,
            leverage: ticket.leverage,
            contract_size,
            closed_lot: 0.0,
            close_price: None,
            close_reason: None,
            session: None,
            pending_order_id: ticket.pending_order_id,
            opened_at: now,
            closed_at: None,
        };
        trade.floating_pnl = trade.mark(quote.bid, quote.ask);

        self.repo.save_trade(&trade)?;
        // Opening moves no money; the projection is recomputed on the next read.
        if let Err(e) = self.load_wallet(&trade.user_id).and_then(|w| self.project_locked(w)) {
            warn!(id = %trade.id, user_id = %trade.user_id, error = %e, "wallet projection after open failed");
        }

        info!(
            id = %trade.id,
            user_id = %trade.user_id,
            symbol = %trade.symbol,
            side = %trade.side,
            lot = trade.lot,
            entry_price,
            margin,
            leverage = trade.leverage,
            "trade opened"
        );
        Ok(trade)
    }

    /// Close `lot` of a trade at the side's exit price, or all of it when
    /// `lot` is `None`. A partial close leaves the trade `partial`.
    pub fn close_trade(&self, user_id: &str, trade_id: &str, lot: Option<f64>) -> EngineResult<Trade> {
        let trade = {
            let lane = self.lane(user_id);
            let _guard = lane.lock();

            let mut trade = self.owned_trade(user_id, trade_id)?;
            if !trade.is_active() {
                return Err(EngineError::Conflict(format!("trade {trade_id} is already closed")));
            }

            let remaining = trade.remaining_lot();
            let close_lot = lot.unwrap_or(remaining);
            if !close_lot.is_finite() || close_lot <= 0.0 {
                return Err(EngineError::InvalidLot {
                    lot: close_lot,
                    min: self.limits.min_lot,
                    max: remaining,
                });
            }
            if close_lot > remaining + LOT_EPSILON {
                return Err(EngineError::Conflict(format!(
                    "cannot close {close_lot} lots of trade {trade_id}: only {remaining} remain"
                )));
            }
            // A partial close must itself be a valid lot and leave one behind.
            let min_lot = self.limits.min_lot;
            let full = close_lot >= remaining - LOT_EPSILON;
            if !full
                && (close_lot < min_lot - LOT_EPSILON || remaining - close_lot < min_lot - LOT_EPSILON)
            {
                return Err(EngineError::InvalidLot {
                    lot: close_lot,
                    min: min_lot,
                    max: (remaining - min_lot).max(0.0),
                });
            }

            let quote = self.tradable_quote(&trade.symbol)?;
            let close_price = calc::exit_price(trade.side, quote.bid, quote.ask);
            let pnl = self.settle_close_locked(
                &mut trade,
                close_lot,
                close_price,
                CloseReason::Manual,
                Utc::now(),
            )?;

            info!(
                id = %trade.id,
                user_id,
                symbol = %trade.symbol,
                closed_lot = close_lot,
                close_price,
                realized_pnl = pnl,
                status = %trade.status,
                "trade closed manually"
            );
            trade
        };

        let event = if trade.is_active() {
            Event::TradeUpdated(trade.clone())
        } else {
            Event::TradeClosed(trade.clone())
        };
        self.bus.publish(event);
        Ok(trade)
    }

    /// Apply a (partial) close to `trade`, persist it, then credit the
    /// realized PnL for `close_lot` to the wallet. Returns that PnL.
    ///
    /// The caller holds the user's lane and has checked the trade is active.
    fn settle_close_locked(
        &self,
        trade: &mut Trade,
        close_lot: f64,
        close_price: f64,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> EngineResult<f64> {
        let mut wallet = self.load_wallet(&trade.user_id)?;
        let before = trade.clone();

        let remaining = trade.remaining_lot();
        let full = close_lot >= remaining - LOT_EPSILON;
        let close_lot = if full { remaining } else { close_lot };
        let pnl = calc::realized_pnl(
            trade.side,
            trade.entry_price,
            close_price,
            close_lot,
            trade.contract_size,
        );

        trade.realized_pnl = calc::round_money(trade.realized_pnl + pnl);
        trade.close_price = Some(close_price);
        trade.close_reason = Some(reason);
        if full {
            trade.closed_lot = trade.lot;
            trade.status = TradeStatus::Closed;
            trade.floating_pnl = 0.0;
            trade.closed_at = Some(now);
            trade.session = Some(TradingSession::at(now));
        } else {
            let left = remaining - close_lot;
            trade.closed_lot += close_lot;
            trade.status = TradeStatus::Partial;
            trade.margin = calc::round_money(trade.margin * left / remaining);
            trade.floating_pnl = calc::realized_pnl(
                trade.side,
                trade.entry_price,
                close_price,
                left,
                trade.contract_size,
            );
        }

        // The status transition is stored before the credit. A failed credit
        // puts the trade back so a later close or sweep can retry it.
        if let Err(e) = self.repo.save_trade(trade) {
            *trade = before;
            return Err(e.into());
        }

        wallet.balance = calc::round_money(wallet.balance + pnl);
        if let Err(e) = self.project_locked(wallet) {
            if let Err(restore) = self.repo.save_trade(&before) {
                error!(id = %before.id, error = %restore, "could not restore trade after failed credit");
            }
            *trade = before;
            return Err(e);
        }
        Ok(pnl)
    }

    /// Replace a trade's stop-loss and take-profit. `None` clears a level.
    pub fn modify_sltp(
        &self,
        user_id: &str,
        trade_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> EngineResult<Trade> {
        let trade = {
            let lane = self.lane(user_id);
            let _guard = lane.lock();

            let mut trade = self.owned_trade(user_id, trade_id)?;
            if !trade.is_active() {
                return Err(EngineError::Conflict(format!("trade {trade_id} is already closed")));
            }
            validation::validate_stops(trade.side, trade.entry_price, stop_loss, take_profit)?;

            trade.stop_loss = stop_loss;
            trade.take_profit = take_profit;
            self.repo.save_trade(&trade)?;

            info!(id = %trade.id, user_id, ?stop_loss, ?take_profit, "trade stops modified");
            trade
        };

        self.bus.publish(Event::TradeUpdated(trade.clone()));
        Ok(trade)
    }

    pub fn trade(&self, user_id: &str, trade_id: &str) -> EngineResult<Trade> {
        self.owned_trade(user_id, trade_id)
    }

    pub fn user_trades(&self, user_id: &str) -> EngineResult<Vec<Trade>> {
        Ok(self.repo.user_trades(user_id)?)
    }

    // -------------------------------------------------------------------------
    // Pending orders
    // -------------------------------------------------------------------------

    /// Place a resting order. Margin is reserved at the trigger price.
    pub fn create_pending_order(&self, req: PendingOrderRequest) -> EngineResult<PendingOrder> {
        self.limits.validate_lot(req.lot)?;
        let leverage = self.limits.resolve_leverage(req.leverage)?;
        let symbol = normalize_symbol(&req.symbol);
        let side = req.order_type.side();
        let quote = self.tradable_quote(&symbol)?;
        validation::validate_trigger(req.order_type, req.trigger_price, quote)?;
        validation::validate_stops(side, req.trigger_price, req.stop_loss, req.take_profit)?;
        let now = Utc::now();
        validation::validate_expiry(req.expires_at, now)?;
        let margin = calc::margin(
            req.lot,
            req.trigger_price,
            calc::contract_size(&symbol),
            leverage as f64,
        );

        let lane = self.lane(&req.user_id);
        let _guard = lane.lock();

        let wallet = self.project_locked(self.load_wallet(&req.user_id)?)?;
        if margin > wallet.free_margin {
            return Err(EngineError::InsufficientMargin {
                required: margin,
                free: wallet.free_margin,
            });
        }

        let order = PendingOrder {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            symbol,
            order_type: req.order_type,
            side,
            lot: req.lot,
            trigger_price: req.trigger_price,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            status: OrderStatus::Pending,
            margin,
            leverage,
            expires_at: req.expires_at,
            created_at: now,
            executed_at: None,
            trade_id: None,
            cancel_reason: None,
        };
        self.repo.save_order(&order)?;

        info!(
            id = %order.id,
            user_id = %order.user_id,
            symbol = %order.symbol,
            order_type = %order.order_type,
            lot = order.lot,
            trigger_price = order.trigger_price,
            margin,
            "pending order placed"
        );
        Ok(order)
    }

    /// Replace the trigger, stops and expiry of a pending order and reserve
    /// margin again at the new trigger.
    pub fn modify_pending_order(
        &self,
        user_id: &str,
        order_id: &str,
        changes: OrderChanges,
    ) -> EngineResult<PendingOrder> {
        let lane = self.lane(user_id);
        let _guard = lane.lock();

        let mut order = self.owned_order(user_id, order_id)?;
        if !order.is_pending() {
            return Err(EngineError::Conflict(format!(
                "order {order_id} is {}, only pending orders can be modified",
                order.status
            )));
        }

        let quote = self.tradable_quote(&order.symbol)?;
        validation::validate_trigger(order.order_type, changes.trigger_price, quote)?;
        validation::validate_stops(
            order.side,
            changes.trigger_price,
            changes.stop_loss,
            changes.take_profit,
        )?;
        validation::validate_expiry(changes.expires_at, Utc::now())?;
        let margin = calc::margin(
            order.lot,
            changes.trigger_price,
            calc::contract_size(&order.symbol),
            order.leverage as f64,
        );

        let wallet = self.project_locked(self.load_wallet(user_id)?)?;
        if margin > wallet.free_margin {
            return Err(EngineError::InsufficientMargin {
                required: margin,
                free: wallet.free_margin,
            });
        }

        order.trigger_price = changes.trigger_price;
        order.stop_loss = changes.stop_loss;
        order.take_profit = changes.take_profit;
        order.expires_at = changes.expires_at;
        order.margin = margin;
        self.repo.save_order(&order)?;

        info!(id = %order.id, user_id, trigger_price = order.trigger_price, margin, "pending order modified");
        Ok(order)
    }

    pub fn cancel_pending_order(&self, user_id: &str, order_id: &str) -> EngineResult<PendingOrder> {
        let lane = self.lane(user_id);
        let _guard = lane.lock();

        let mut order = self.owned_order(user_id, order_id)?;
        if !order.is_pending() {
            return Err(EngineError::Conflict(format!(
                "order {order_id} is {}, only pending orders can be cancelled",
                order.status
            )));
        }

        order.status = OrderStatus::Cancelled;
        order.cancel_reason = Some(CANCELLED_BY_USER.to_string());
        self.repo.save_order(&order)?;

        info!(id = %order.id, user_id, "pending order cancelled");
        Ok(order)
    }

    pub fn order(&self, user_id: &str, order_id: &str) -> EngineResult<PendingOrder> {
        self.owned_order(user_id, order_id)
    }

    pub fn user_orders(&self, user_id: &str) -> EngineResult<Vec<PendingOrder>> {
        Ok(self.repo.user_orders(user_id)?)
    }

    // -------------------------------------------------------------------------
    // SL/TP sweep
    // -------------------------------------------------------------------------

    /// Evaluate stop-loss/take-profit for every active trade.
    pub fn check_sltp(&self) -> SweepReport {
        self.sweep_sltp(None)
    }

    /// Evaluate stop-loss/take-profit for active trades on `symbol` only.
    pub fn check_sltp_for(&self, symbol: &str) -> SweepReport {
        self.sweep_sltp(Some(symbol))
    }

    fn sweep_sltp(&self, symbol: Option<&str>) -> SweepReport {
        let mut report = SweepReport::default();

        let trades = match self.repo.active_trades() {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "SL/TP sweep could not load active trades");
                report.failed += 1;
                return report;
            }
        };

        for trade in trades
            .iter()
            .filter(|t| symbol.map_or(true, |s| t.symbol == s))
            .filter(|t| t.stop_loss.is_some() || t.take_profit.is_some())
        {
            let Some(quote) = self.store.live_quote(&trade.symbol) else {
                debug!(id = %trade.id, symbol = %trade.symbol, "no live price, SL/TP check skipped");
                report.skipped += 1;
                continue;
            };
            report.evaluated += 1;

            let decision = calc::should_trigger_sltp(
                trade.side,
                quote.bid,
                quote.ask,
                trade.stop_loss,
                trade.take_profit,
            );
            if !decision.triggered {
                continue;
            }

            match self.close_on_trigger(&trade.id, &trade.user_id, quote) {
                Ok(Some(closed)) => {
                    report.triggered += 1;
                    self.bus.publish(Event::TradeClosed(closed));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(id = %trade.id, user_id = %trade.user_id, error = %e, "SL/TP close failed");
                    report.failed += 1;
                }
            }
        }

        if report.is_quiet() {
            debug!(?report, "SL/TP sweep complete");
        } else {
            info!(?report, "SL/TP sweep complete");
        }
        report
    }

    /// Re-check the trade under the lane and close its remaining lot if it is
    /// still active and still triggered at `quote`.
    fn close_on_trigger(&self, trade_id: &str, user_id: &str, quote: Quote) -> EngineResult<Option<Trade>> {
        let lane = self.lane(user_id);
        let _guard = lane.lock();

        let Some(mut trade) = self.repo.trade(trade_id)? else {
            return Ok(None);
        };
        if !trade.is_active() {
            return Ok(None);
        }
        let decision = calc::should_trigger_sltp(
            trade.side,
            quote.bid,
            quote.ask,
            trade.stop_loss,
            trade.take_profit,
        );
        let Some(reason) = decision.reason else {
            return Ok(None);
        };

        let remaining = trade.remaining_lot();
        let pnl = self.settle_close_locked(&mut trade, remaining, decision.close_price, reason, Utc::now())?;

        info!(
            id = %trade.id,
            user_id = %trade.user_id,
            symbol = %trade.symbol,
            reason = %reason,
            close_price = decision.close_price,
            realized_pnl = pnl,
            "trade closed by trigger"
        );
        Ok(Some(trade))
    }

    // -------------------------------------------------------------------------
    // Pending-order sweep
    // -------------------------------------------------------------------------

    /// Expire, execute or leave every pending order.
    pub fn check_pending_orders(&self) -> SweepReport {
        self.sweep_pending(None, Utc::now())
    }

    /// Same as [`check_pending_orders`](Self::check_pending_orders) with an
    /// explicit clock for expiry.
    pub fn check_pending_orders_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.sweep_pending(None, now)
    }

    pub fn check_pending_orders_for(&self, symbol: &str) -> SweepReport {
        self.sweep_pending(Some(symbol), Utc::now())
    }

    fn sweep_pending(&self, symbol: Option<&str>, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let orders = match self.repo.pending_orders() {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "pending-order sweep could not load orders");
                report.failed += 1;
                return report;
            }
        };

        for order in orders.iter().filter(|o| symbol.map_or(true, |s| o.symbol == s)) {
            if order.is_expired_at(now) {
                match self.expire_order(&order.id, &order.user_id, now) {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(id = %order.id, error = %e, "order expiry failed");
                        report.failed += 1;
                    }
                }
                continue;
            }

            let Some(quote) = self.store.live_quote(&order.symbol) else {
                debug!(id = %order.id, symbol = %order.symbol, "no live price, order check skipped");
                report.skipped += 1;
                continue;
            };
            report.evaluated += 1;

            if !calc::pending_order_triggered(order.order_type, order.trigger_price, quote.bid, quote.ask) {
                continue;
            }

            match self.execute_order(&order.id, &order.user_id, quote, now) {
                Ok(OrderOutcome::Executed(trade)) => {
                    report.triggered += 1;
                    self.bus.publish(Event::TradeOpened(trade));
                }
                Ok(OrderOutcome::Cancelled) => report.cancelled += 1,
                Ok(OrderOutcome::Unchanged) => {}
                Err(e) => {
                    warn!(id = %order.id, user_id = %order.user_id, error = %e, "order execution failed");
                    report.failed += 1;
                }
            }
        }

        if report.is_quiet() {
            debug!(?report, "pending-order sweep complete");
        } else {
            info!(?report, "pending-order sweep complete");
        }
        report
    }

    fn expire_order(&self, order_id: &str, user_id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        let lane = self.lane(user_id);
        let _guard = lane.lock();

        let Some(mut order) = self.repo.order(order_id)? else {
            return Ok(false);
        };
        if !order.is_pending() || !order.is_expired_at(now) {
            return Ok(false);
        }
        order.status = OrderStatus::Expired;
        self.repo.save_order(&order)?;

        info!(id = %order.id, user_id, "pending order expired");
        Ok(true)
    }

    fn execute_order(
        &self,
        order_id: &str,
        user_id: &str,
        quote: Quote,
        now: DateTime<Utc>,
    ) -> EngineResult<OrderOutcome> {
        let lane = self.lane(user_id);
        let _guard = lane.lock();

        let Some(mut order) = self.repo.order(order_id)? else {
            return Ok(OrderOutcome::Unchanged);
        };
        if !order.is_pending()
            || !calc::pending_order_triggered(order.order_type, order.trigger_price, quote.bid, quote.ask)
        {
            return Ok(OrderOutcome::Unchanged);
        }

        let wallet = self.project_locked(self.load_wallet(user_id)?)?;
        if wallet.free_margin < order.margin {
            order.status = OrderStatus::Cancelled;
            order.cancel_reason = Some(INSUFFICIENT_MARGIN_AT_EXECUTION.to_string());
            self.repo.save_order(&order)?;
            warn!(
                id = %order.id,
                user_id,
                required = order.margin,
                free_margin = wallet.free_margin,
                "pending order cancelled: insufficient margin at execution"
            );
            return Ok(OrderOutcome::Cancelled);
        }

        // The order leaves `pending` before the trade exists.
        let pending = order.clone();
        let trade_id = Uuid::new_v4().to_string();
        order.status = OrderStatus::Executed;
        order.executed_at = Some(now);
        order.trade_id = Some(trade_id.clone());
        self.repo.save_order(&order)?;

        let ticket = TradeTicket {
            user_id,
            symbol: &order.symbol,
            side: order.side,
            lot: order.lot,
            leverage: order.leverage,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            pending_order_id: Some(order.id.clone()),
        };
        let trade = match self.open_locked(ticket, quote, trade_id, now) {
            Ok(trade) => trade,
            Err(e) => {
                if let Err(restore) = self.repo.save_order(&pending) {
                    error!(id = %pending.id, error = %restore, "could not restore order after failed execution");
                }
                return Err(e);
            }
        };

        info!(id = %order.id, trade_id = %trade.id, entry_price = trade.entry_price, "pending order executed");
        Ok(OrderOutcome::Executed(trade))
    }
}

impl std::fmt::Debug for TradeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeEngine")
            .field("limits", &self.limits)
            .field("lanes", &self.lanes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::trading::MemoryRepository;
    use crate::types::PriceUpdate;
    use chrono::Duration;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    struct Harness {
        engine: TradeEngine,
        store: Arc<InstrumentStore>,
        bus: EventBus,
    }

    fn harness_with(repo: Arc<dyn Repository>) -> Harness {
        let store = Arc::new(InstrumentStore::default());
        let bus = EventBus::default();
        let engine = TradeEngine::new(repo, store.clone(), bus.clone(), TradingLimits::default());
        Harness { engine, store, bus }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryRepository::new()))
    }

    impl Harness {
        fn quote(&self, symbol: &str, bid: f64, ask: f64) {
            self.store.on_price_update(&PriceUpdate {
                symbol: symbol.into(),
                bid,
                ask,
                spread: ask - bid,
                time: 0,
            });
        }

        fn open(&self, user: &str, side: Side, lot: f64, sl: Option<f64>, tp: Option<f64>) -> EngineResult<Trade> {
            self.engine.create_trade(OpenTradeRequest {
                user_id: user.into(),
                symbol: "EURUSD".into(),
                side,
                lot,
                leverage: None,
                stop_loss: sl,
                take_profit: tp,
            })
        }

        fn place(&self, user: &str, order_type: OrderType, trigger: f64) -> EngineResult<PendingOrder> {
            self.engine.create_pending_order(PendingOrderRequest {
                user_id: user.into(),
                symbol: "EURUSD".into(),
                order_type,
                lot: 1.0,
                trigger_price: trigger,
                leverage: None,
                stop_loss: None,
                take_profit: None,
                expires_at: None,
            })
        }

        fn balance(&self, user: &str) -> f64 {
            self.engine.wallet(user).unwrap().balance
        }
    }

    // --- wallet -------------------------------------------------------------

    #[test]
    fn funding_creates_and_credits_wallet() {
        let h = harness();
        let w = h.engine.fund_wallet("u1", 1_000.0).unwrap();
        assert_eq!(w.balance, 1_000.0);
        assert_eq!(w.equity, 1_000.0);
        assert_eq!(w.margin_level, 0.0);
        let w = h.engine.fund_wallet("u1", 250.5).unwrap();
        assert_eq!(w.balance, 1_250.5);

        assert!(matches!(h.engine.fund_wallet("u1", -5.0), Err(EngineError::InvalidAmount(_))));
        assert!(matches!(h.engine.wallet("nobody"), Err(EngineError::WalletNotFound(_))));
    }

    #[test]
    fn wallet_recompute_is_idempotent() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        h.open("u1", Side::Buy, 1.0, None, None).unwrap();
        h.quote("EURUSD", 1.1010, 1.1012);

        let first = h.engine.wallet("u1").unwrap();
        let second = h.engine.wallet("u1").unwrap();
        assert_eq!(first.balance, second.balance);
        assert!(second.matches(&calc::WalletFigures {
            equity: first.equity,
            margin: first.margin,
            free_margin: first.free_margin,
            margin_level: first.margin_level,
            floating_profit: first.floating_profit,
        }));
        // Entry at ask 1.1002, marked at bid 1.1010.
        assert!(approx(first.floating_profit, 80.0));
    }

    // --- trade admission ----------------------------------------------------

    #[test]
    fn buy_opens_at_ask_and_reserves_margin() {
        let h = harness();
        let mut sub = h.bus.subscribe(EventKind::TradeOpened);
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();

        let trade = h.open("u1", Side::Buy, 1.0, Some(1.0950), Some(1.1100)).unwrap();
        assert_eq!(trade.entry_price, 1.1002);
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.leverage, 100);
        assert_eq!(trade.contract_size, 100_000.0);
        assert!(approx(trade.margin, 1_100.2));
        assert!(approx(trade.floating_pnl, -20.0));

        let w = h.engine.wallet("u1").unwrap();
        assert!(approx(w.equity, 9_980.0));
        assert!(approx(w.margin, 1_100.2));
        assert!(approx(w.free_margin, 8_879.8));

        match sub.try_recv() {
            Some(Event::TradeOpened(t)) => assert_eq!(t.id, trade.id),
            other => panic!("expected trade:opened, got {other:?}"),
        }
    }

    #[test]
    fn sell_opens_at_bid() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Sell, 0.5, None, None).unwrap();
        assert_eq!(trade.entry_price, 1.1000);
    }

    #[test]
    fn admission_rejects_with_specific_reasons() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 500.0).unwrap();

        assert!(matches!(
            h.open("u1", Side::Buy, 1.0, None, None),
            Err(EngineError::InsufficientMargin { .. })
        ));
        assert!(matches!(
            h.open("u1", Side::Buy, 0.001, None, None),
            Err(EngineError::InvalidLot { .. })
        ));
        assert!(matches!(
            h.open("u1", Side::Buy, 0.01, Some(1.2), None),
            Err(EngineError::InvalidStops(_))
        ));
        assert!(matches!(
            h.open("nobody", Side::Buy, 0.01, None, None),
            Err(EngineError::WalletNotFound(_))
        ));

        let err = h
            .engine
            .create_trade(OpenTradeRequest {
                user_id: "u1".into(),
                symbol: "NZDCAD".into(),
                side: Side::Buy,
                lot: 0.01,
                leverage: Some(100),
                stop_loss: None,
                take_profit: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSymbol(_)));

        let err = h
            .engine
            .create_trade(OpenTradeRequest {
                user_id: "u1".into(),
                symbol: "eurusd".into(),
                side: Side::Buy,
                lot: 0.01,
                leverage: Some(1_000),
                stop_loss: None,
                take_profit: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidLeverage { .. }));

        assert!(h.engine.user_trades("u1").unwrap().is_empty());
    }

    #[test]
    fn zero_price_is_unavailable() {
        let h = harness();
        h.quote("EURUSD", 0.0, 0.0);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        assert!(matches!(
            h.open("u1", Side::Buy, 0.1, None, None),
            Err(EngineError::PriceUnavailable(_))
        ));
    }

    // --- manual close -------------------------------------------------------

    #[test]
    fn partial_then_full_close() {
        let h = harness();
        let mut sub = h.bus.subscribe_many(&[EventKind::TradeUpdated, EventKind::TradeClosed]);
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, None, None).unwrap();

        h.quote("EURUSD", 1.1012, 1.1014);
        let partial = h.engine.close_trade("u1", &trade.id, Some(0.5)).unwrap();
        assert_eq!(partial.status, TradeStatus::Partial);
        assert!(approx(partial.closed_lot, 0.5));
        assert!(approx(partial.realized_pnl, 50.0));
        assert!(approx(partial.margin, 550.1));
        assert_eq!(partial.close_reason, Some(CloseReason::Manual));
        assert!(approx(h.balance("u1"), 10_050.0));
        assert!(matches!(sub.try_recv(), Some(Event::TradeUpdated(_))));

        let closed = h.engine.close_trade("u1", &trade.id, None).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert!(approx(closed.closed_lot, 1.0));
        assert!(approx(closed.realized_pnl, 100.0));
        assert_eq!(closed.close_price, Some(1.1012));
        assert!(closed.closed_at.is_some());
        assert!(closed.session.is_some());
        assert!(approx(h.balance("u1"), 10_100.0));
        assert!(matches!(sub.try_recv(), Some(Event::TradeClosed(_))));

        let w = h.engine.wallet("u1").unwrap();
        assert_eq!(w.margin, 0.0);
        assert_eq!(w.equity, w.balance);

        assert!(matches!(
            h.engine.close_trade("u1", &trade.id, None),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn closing_more_than_remains_is_a_conflict() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, None, None).unwrap();

        assert!(matches!(
            h.engine.close_trade("u1", &trade.id, Some(1.5)),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            h.engine.close_trade("u1", &trade.id, Some(0.0)),
            Err(EngineError::InvalidLot { .. })
        ));
        assert!(matches!(
            h.engine.close_trade("u2", &trade.id, None),
            Err(EngineError::TradeNotFound(_))
        ));
        assert_eq!(h.engine.trade("u1", &trade.id).unwrap().status, TradeStatus::Open);
    }

    #[test]
    fn partial_close_respects_min_lot() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, None, None).unwrap();

        assert!(matches!(
            h.engine.close_trade("u1", &trade.id, Some(1e-6)),
            Err(EngineError::InvalidLot { .. })
        ));
        assert!(matches!(
            h.engine.close_trade("u1", &trade.id, Some(0.995)),
            Err(EngineError::InvalidLot { .. })
        ));
        let t = h.engine.trade("u1", &trade.id).unwrap();
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.closed_lot, 0.0);

        let partial = h.engine.close_trade("u1", &trade.id, Some(0.99)).unwrap();
        assert!(approx(partial.remaining_lot(), 0.01));
        let closed = h.engine.close_trade("u1", &trade.id, Some(0.01)).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
    }

    #[test]
    fn unknown_users_share_fixed_lanes() {
        let h = harness();
        for i in 0..1_000 {
            assert!(matches!(
                h.engine.wallet(&format!("ghost-{i}")),
                Err(EngineError::WalletNotFound(_))
            ));
        }
        let debug = format!("{:?}", h.engine);
        assert!(debug.contains(&format!("lanes: {LANE_SHARDS}")), "{debug}");
    }

    #[test]
    fn modify_sltp_validates_against_entry() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Sell, 1.0, None, None).unwrap();

        let t = h.engine.modify_sltp("u1", &trade.id, Some(1.1050), Some(1.0900)).unwrap();
        assert_eq!(t.stop_loss, Some(1.1050));
        assert_eq!(t.take_profit, Some(1.0900));

        assert!(matches!(
            h.engine.modify_sltp("u1", &trade.id, Some(1.0950), None),
            Err(EngineError::InvalidStops(_))
        ));

        let cleared = h.engine.modify_sltp("u1", &trade.id, None, None).unwrap();
        assert_eq!(cleared.stop_loss, None);

        h.engine.close_trade("u1", &trade.id, None).unwrap();
        assert!(matches!(
            h.engine.modify_sltp("u1", &trade.id, None, None),
            Err(EngineError::Conflict(_))
        ));
    }

    // --- SL/TP sweep --------------------------------------------------------

    #[test]
    fn stop_loss_closes_buy_at_bid() {
        let h = harness();
        let mut sub = h.bus.subscribe(EventKind::TradeClosed);
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, Some(1.0960), None).unwrap();

        h.quote("EURUSD", 1.0970, 1.0972);
        let report = h.engine.check_sltp();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.triggered, 0);

        h.quote("EURUSD", 1.0950, 1.0952);
        let report = h.engine.check_sltp();
        assert_eq!(report.triggered, 1);

        let closed = h.engine.trade("u1", &trade.id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(closed.close_price, Some(1.0950));
        assert!(approx(closed.realized_pnl, -520.0));
        assert!(approx(h.balance("u1"), 9_480.0));
        assert!(matches!(sub.try_recv(), Some(Event::TradeClosed(_))));

        // Nothing left to close.
        assert_eq!(h.engine.check_sltp(), SweepReport::default());
        assert!(approx(h.balance("u1"), 9_480.0));
    }

    #[test]
    fn take_profit_closes_sell_at_ask() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Sell, 1.0, None, Some(1.0990)).unwrap();

        h.quote("EURUSD", 1.0987, 1.0989);
        let report = h.engine.check_sltp_for("EURUSD");
        assert_eq!(report.triggered, 1);

        let closed = h.engine.trade("u1", &trade.id).unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(closed.close_price, Some(1.0989));
        assert!(approx(closed.realized_pnl, 110.0));
    }

    #[test]
    fn sweep_skips_unpriced_symbols() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        h.open("u1", Side::Buy, 1.0, Some(1.0960), None).unwrap();

        h.quote("EURUSD", 0.0, 0.0);
        let report = h.engine.check_sltp();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.triggered, 0);
        assert_eq!(h.engine.user_trades("u1").unwrap()[0].status, TradeStatus::Open);
    }

    #[test]
    fn concurrent_closers_credit_once() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, Some(1.0960), None).unwrap();
        h.quote("EURUSD", 1.0950, 1.0952);

        let closes = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..8 {
                let (h, closes, id) = (&h, &closes, trade.id.clone());
                s.spawn(move || {
                    let won = if i % 2 == 0 {
                        h.engine.check_sltp().triggered
                    } else {
                        usize::from(h.engine.close_trade("u1", &id, None).is_ok())
                    };
                    closes.fetch_add(won, std::sync::atomic::Ordering::SeqCst);
                });
            }
        });

        assert_eq!(closes.into_inner(), 1);
        assert!(approx(h.balance("u1"), 9_480.0));
        assert!(approx(h.engine.trade("u1", &trade.id).unwrap().realized_pnl, -520.0));
    }

    /// Fails `save_trade` for one trade id, or every trade or wallet write
    /// while the matching switch is on.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryRepository,
        poisoned: Mutex<Option<String>>,
        reject_trades: Mutex<bool>,
        reject_wallets: Mutex<bool>,
    }

    impl Repository for FlakyRepository {
        fn wallet(&self, user_id: &str) -> anyhow::Result<Option<Wallet>> {
            self.inner.wallet(user_id)
        }
        fn save_wallet(&self, wallet: &Wallet) -> anyhow::Result<()> {
            if *self.reject_wallets.lock() {
                anyhow::bail!("wallet write rejected for {}", wallet.user_id);
            }
            self.inner.save_wallet(wallet)
        }
        fn trade(&self, id: &str) -> anyhow::Result<Option<Trade>> {
            self.inner.trade(id)
        }
        fn save_trade(&self, trade: &Trade) -> anyhow::Result<()> {
            if *self.reject_trades.lock() || self.poisoned.lock().as_deref() == Some(trade.id.as_str()) {
                anyhow::bail!("write rejected for {}", trade.id);
            }
            self.inner.save_trade(trade)
        }
        fn active_trades(&self) -> anyhow::Result<Vec<Trade>> {
            self.inner.active_trades()
        }
        fn user_trades(&self, user_id: &str) -> anyhow::Result<Vec<Trade>> {
            self.inner.user_trades(user_id)
        }
        fn order(&self, id: &str) -> anyhow::Result<Option<PendingOrder>> {
            self.inner.order(id)
        }
        fn save_order(&self, order: &PendingOrder) -> anyhow::Result<()> {
            self.inner.save_order(order)
        }
        fn pending_orders(&self) -> anyhow::Result<Vec<PendingOrder>> {
            self.inner.pending_orders()
        }
        fn user_orders(&self, user_id: &str) -> anyhow::Result<Vec<PendingOrder>> {
            self.inner.user_orders(user_id)
        }
    }

    #[test]
    fn one_failing_trade_does_not_stop_the_sweep() {
        let repo = Arc::new(FlakyRepository::default());
        let h = harness_with(repo.clone());
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        h.engine.fund_wallet("u2", 10_000.0).unwrap();
        let bad = h.open("u1", Side::Buy, 1.0, Some(1.0960), None).unwrap();
        let good = h.open("u2", Side::Buy, 1.0, Some(1.0960), None).unwrap();

        // Marks stop changing once the price is fixed, so only the close
        // path writes the poisoned trade.
        h.quote("EURUSD", 1.0950, 1.0952);
        h.engine.wallet("u1").unwrap();
        *repo.poisoned.lock() = Some(bad.id.clone());

        let report = h.engine.check_sltp();
        assert_eq!(report.triggered, 1);
        assert_eq!(report.failed, 1);

        assert_eq!(h.engine.trade("u2", &good.id).unwrap().status, TradeStatus::Closed);
        assert!(approx(h.balance("u2"), 9_480.0));
        assert_eq!(h.engine.trade("u1", &bad.id).unwrap().status, TradeStatus::Open);
        assert!(approx(h.balance("u1"), 10_000.0));
    }

    #[test]
    fn failed_credit_leaves_trade_open_for_retry() {
        let repo = Arc::new(FlakyRepository::default());
        let h = harness_with(repo.clone());
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, None, Some(1.1100)).unwrap();

        h.quote("EURUSD", 1.1100, 1.1102);
        *repo.reject_wallets.lock() = true;
        let report = h.engine.check_sltp();
        assert_eq!(report.triggered, 0);
        assert_eq!(report.failed, 1);

        let t = repo.inner.trade(&trade.id).unwrap().unwrap();
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.realized_pnl, 0.0);
        assert!(t.closed_at.is_none());

        *repo.reject_wallets.lock() = false;
        let report = h.engine.check_sltp();
        assert_eq!(report.triggered, 1);
        let t = h.engine.trade("u1", &trade.id).unwrap();
        assert_eq!(t.status, TradeStatus::Closed);
        assert!(approx(t.realized_pnl, 980.0));
        assert!(approx(h.balance("u1"), 10_980.0));
    }

    #[test]
    fn failed_manual_close_is_not_half_applied() {
        let repo = Arc::new(FlakyRepository::default());
        let h = harness_with(repo.clone());
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let trade = h.open("u1", Side::Buy, 1.0, None, None).unwrap();

        *repo.reject_wallets.lock() = true;
        assert!(matches!(
            h.engine.close_trade("u1", &trade.id, Some(0.5)),
            Err(EngineError::Repository(_))
        ));
        let t = repo.inner.trade(&trade.id).unwrap().unwrap();
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.closed_lot, 0.0);
        assert!(approx(t.margin, 1_100.2));
    }

    #[test]
    fn failed_execution_keeps_order_pending() {
        let repo = Arc::new(FlakyRepository::default());
        let h = harness_with(repo.clone());
        h.quote("EURUSD", 1.1003, 1.1005);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let order = h.place("u1", OrderType::BuyLimit, 1.1000).unwrap();

        h.quote("EURUSD", 1.0997, 1.0999);
        *repo.reject_trades.lock() = true;
        let report = h.engine.check_pending_orders();
        assert_eq!(report.triggered, 0);
        assert_eq!(report.failed, 1);

        let stored = h.engine.order("u1", &order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(stored.trade_id.is_none());
        assert!(stored.executed_at.is_none());
        assert!(h.engine.user_trades("u1").unwrap().is_empty());

        *repo.reject_trades.lock() = false;
        let report = h.engine.check_pending_orders();
        assert_eq!(report.triggered, 1);
        assert_eq!(h.engine.order("u1", &order.id).unwrap().status, OrderStatus::Executed);
    }

    // --- pending orders -----------------------------------------------------

    #[test]
    fn buy_limit_executes_at_ask_once_reached() {
        let h = harness();
        let mut sub = h.bus.subscribe(EventKind::TradeOpened);
        h.quote("EURUSD", 1.1003, 1.1005);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let order = h.place("u1", OrderType::BuyLimit, 1.1000).unwrap();
        assert!(approx(order.margin, 1_100.0));
        assert_eq!(order.side, Side::Buy);

        let report = h.engine.check_pending_orders();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.triggered, 0);

        h.quote("EURUSD", 1.0997, 1.0999);
        let report = h.engine.check_pending_orders_for("EURUSD");
        assert_eq!(report.triggered, 1);

        let order = h.engine.order("u1", &order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        let trade_id = order.trade_id.clone().unwrap();
        let trade = h.engine.trade("u1", &trade_id).unwrap();
        assert_eq!(trade.entry_price, 1.0999);
        assert_eq!(trade.pending_order_id.as_deref(), Some(order.id.as_str()));
        assert!(matches!(sub.try_recv(), Some(Event::TradeOpened(t)) if t.id == trade_id));

        // Executed orders are not swept again.
        assert_eq!(h.engine.check_pending_orders().triggered, 0);
        assert_eq!(h.engine.user_trades("u1").unwrap().len(), 1);
    }

    #[test]
    fn insufficient_margin_at_execution_cancels_order() {
        let h = harness();
        h.quote("EURUSD", 1.1003, 1.1005);
        h.engine.fund_wallet("u1", 2_000.0).unwrap();
        let order = h.place("u1", OrderType::BuyLimit, 1.1000).unwrap();
        h.open("u1", Side::Buy, 1.0, None, None).unwrap();

        h.quote("EURUSD", 1.0997, 1.0999);
        let report = h.engine.check_pending_orders();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.triggered, 0);

        let order = h.engine.order("u1", &order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancel_reason.as_deref(), Some(INSUFFICIENT_MARGIN_AT_EXECUTION));
        assert_eq!(h.engine.user_trades("u1").unwrap().len(), 1);
    }

    #[test]
    fn expired_orders_are_marked_expired() {
        let h = harness();
        h.quote("EURUSD", 1.1003, 1.1005);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let order = h
            .engine
            .create_pending_order(PendingOrderRequest {
                user_id: "u1".into(),
                symbol: "EURUSD".into(),
                order_type: OrderType::SellStop,
                lot: 0.1,
                trigger_price: 1.0990,
                leverage: Some(50),
                stop_loss: Some(1.1050),
                take_profit: None,
                expires_at: Some(Utc::now() + Duration::minutes(1)),
            })
            .unwrap();

        assert_eq!(h.engine.check_pending_orders().expired, 0);
        let report = h.engine.check_pending_orders_at(Utc::now() + Duration::minutes(2));
        assert_eq!(report.expired, 1);
        assert_eq!(h.engine.order("u1", &order.id).unwrap().status, OrderStatus::Expired);
    }

    #[test]
    fn order_admission_checks_trigger_side_and_expiry() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();

        assert!(matches!(
            h.place("u1", OrderType::BuyLimit, 1.1010),
            Err(EngineError::InvalidTrigger(_))
        ));
        assert!(matches!(
            h.place("u1", OrderType::SellStop, 1.1010),
            Err(EngineError::InvalidTrigger(_))
        ));

        let err = h
            .engine
            .create_pending_order(PendingOrderRequest {
                user_id: "u1".into(),
                symbol: "EURUSD".into(),
                order_type: OrderType::BuyStop,
                lot: 1.0,
                trigger_price: 1.1050,
                leverage: None,
                stop_loss: None,
                take_profit: None,
                expires_at: Some(Utc::now() - Duration::minutes(1)),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidExpiry(_)));

        h.engine.fund_wallet("u2", 100.0).unwrap();
        assert!(matches!(
            h.place("u2", OrderType::BuyLimit, 1.0990),
            Err(EngineError::InsufficientMargin { .. })
        ));
        assert!(h.engine.user_orders("u1").unwrap().is_empty());
    }

    #[test]
    fn modify_and_cancel_pending_order() {
        let h = harness();
        h.quote("EURUSD", 1.1000, 1.1002);
        h.engine.fund_wallet("u1", 10_000.0).unwrap();
        let order = h.place("u1", OrderType::SellLimit, 1.1020).unwrap();

        let modified = h
            .engine
            .modify_pending_order(
                "u1",
                &order.id,
                OrderChanges {
                    trigger_price: 1.1040,
                    stop_loss: Some(1.1080),
                    take_profit: Some(1.1000),
                    expires_at: None,
                },
            )
            .unwrap();
        assert_eq!(modified.trigger_price, 1.1040);
        assert!(approx(modified.margin, 1_104.0));

        let bad = h.engine.modify_pending_order(
            "u1",
            &order.id,
            OrderChanges {
                trigger_price: 1.0990,
                stop_loss: None,
                take_profit: None,
                expires_at: None,
            },
        );
        assert!(matches!(bad, Err(EngineError::InvalidTrigger(_))));

        let cancelled = h.engine.cancel_pending_order("u1", &order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some(CANCELLED_BY_USER));

        assert!(matches!(
            h.engine.cancel_pending_order("u1", &order.id),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            h.engine.cancel_pending_order("u2", &order.id),
            Err(EngineError::OrderNotFound(_))
        ));
    }
}
