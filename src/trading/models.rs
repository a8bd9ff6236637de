// =============================================================================
// Trading records: trades, pending orders, wallets
// =============================================================================
//
// Trade life-cycle:
//   open  ->  partial*  ->  closed
//   open  ->  closed (SL / TP / manual)
//
// Order life-cycle:
//   pending  ->  executed | cancelled | expired
//
// `margin` on a trade is fixed at entry and only shrinks, proportionally, on a
// partial close. Wallet fields other than `balance` are a projection and are
// recomputed on every read or mutation.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calc::{self, WalletFigures};
use crate::types::{CloseReason, OrderStatus, OrderType, Side, TradeStatus, TradingSession};

/// Lot quantities closer than this are treated as equal.
pub const LOT_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    /// Lot size at entry. Never reduced; see `closed_lot`.
    pub lot: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: TradeStatus,
    #[serde(rename = "floatingPnL")]
    pub floating_pnl: f64,
    /// Accumulated over every partial and final close.
    #[serde(rename = "realizedPnL")]
    pub realized_pnl: f64,
    pub margin: f64,
    pub leverage: u32,
    pub contract_size: f64,
    pub closed_lot: f64,
    pub close_price: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub session: Option<TradingSession>,
    /// Set when the trade was opened by a pending order.
    pub pending_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Lot still exposed to the market.
    pub fn remaining_lot(&self) -> f64 {
        let remaining = self.lot - self.closed_lot;
        if remaining < LOT_EPSILON {
            0.0
        } else {
            remaining
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Unrealised PnL of the remaining lot at `bid`/`ask`.
    pub fn mark(&self, bid: f64, ask: f64) -> f64 {
        calc::floating_pnl(
            self.side,
            self.entry_price,
            bid,
            ask,
            self.remaining_lot(),
            self.contract_size,
        )
    }
}

// ---------------------------------------------------------------------------
// Pending order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub lot: f64,
    pub trigger_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: OrderStatus,
    /// Reserved at the trigger price when the order was placed or modified.
    pub margin: f64,
    pub leverage: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    /// The trade this order opened.
    pub trade_id: Option<String>,
    pub cancel_reason: Option<String>,
}

impl PendingOrder {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub user_id: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub floating_profit: f64,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Empty wallet for a first deposit.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0.0,
            equity: 0.0,
            margin: 0.0,
            free_margin: 0.0,
            margin_level: 0.0,
            floating_profit: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, figures: WalletFigures) {
        self.equity = figures.equity;
        self.margin = figures.margin;
        self.free_margin = figures.free_margin;
        self.margin_level = figures.margin_level;
        self.floating_profit = figures.floating_profit;
        self.updated_at = Utc::now();
    }

    /// True when the derived fields match `figures`, ignoring `updated_at`.
    pub fn matches(&self, figures: &WalletFigures) -> bool {
        self.equity == figures.equity
            && self.margin == figures.margin
            && self.free_margin == figures.free_margin
            && self.margin_level == figures.margin_level
            && self.floating_profit == figures.floating_profit
    }
}
