// =============================================================================
// Calculation Library: contract sizes, margin, PnL, trigger detection
// =============================================================================
//
// Everything here is pure and deterministic. Money results are rounded to
// cents; prices are never rounded.
//
// Side asymmetry:
//   BUY  enters at ask, exits at bid
//   SELL enters at bid, exits at ask
// The spread is paid through this convention, not through a separate fee.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{CloseReason, OrderType, Side};

/// Contract size used for any symbol not found in the table.
pub const DEFAULT_CONTRACT_SIZE: f64 = 100_000.0;

const FOREX_CONTRACT_SIZE: f64 = 100_000.0;
const GOLD_CONTRACT_SIZE: f64 = 100.0;
const SILVER_CONTRACT_SIZE: f64 = 5_000.0;
const CRYPTO_CONTRACT_SIZE: f64 = 1.0;
const INDEX_CONTRACT_SIZE: f64 = 1.0;

const INDEX_SYMBOLS: &[&str] = &[
    "US30", "US100", "US500", "NAS100", "SPX500", "DJ30", "GER30", "GER40", "DE30", "DE40",
    "UK100", "FRA40", "JP225", "AUS200", "HK50", "EU50",
];

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "NZD", "CAD", "SEK", "NOK", "DKK", "SGD", "HKD",
    "ZAR", "MXN", "TRY", "PLN",
];

// ---------------------------------------------------------------------------
// Contract size
// ---------------------------------------------------------------------------

/// Notional units represented by one lot of `symbol`.
///
/// Lookup is case-insensitive and ignores `/`, `-` and `_` separators, so
/// `eur/usd`, `EURUSD` and `EUR_USD` resolve the same way.
pub fn contract_size(symbol: &str) -> f64 {
    let normalized: String = symbol
        .chars()
        .filter(|c| !matches!(c, '/' | '-' | '_'))
        .collect::<String>()
        .to_ascii_uppercase();

    if normalized.starts_with("XAU") || normalized.starts_with("GOLD") {
        return GOLD_CONTRACT_SIZE;
    }
    if normalized.starts_with("XAG") || normalized.starts_with("SILVER") {
        return SILVER_CONTRACT_SIZE;
    }
    if normalized.starts_with("BTC") || normalized.starts_with("ETH") {
        return CRYPTO_CONTRACT_SIZE;
    }
    if INDEX_SYMBOLS.contains(&normalized.as_str()) {
        return INDEX_CONTRACT_SIZE;
    }
    if is_forex_pair(&normalized) {
        return FOREX_CONTRACT_SIZE;
    }
    DEFAULT_CONTRACT_SIZE
}

fn is_forex_pair(normalized: &str) -> bool {
    normalized.len() == 6
        && normalized.is_char_boundary(3)
        && CURRENCY_CODES.contains(&&normalized[..3])
        && CURRENCY_CODES.contains(&&normalized[3..])
}

// ---------------------------------------------------------------------------
// Margin / PnL
// ---------------------------------------------------------------------------

/// Round a money amount to cents.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Margin reserved for `lot` at `price`. `leverage` must be positive.
pub fn margin(lot: f64, price: f64, contract_size: f64, leverage: f64) -> f64 {
    round_money(lot * contract_size * price / leverage)
}

/// Price a new position is filled at.
pub fn entry_price(side: Side, bid: f64, ask: f64) -> f64 {
    match side {
        Side::Buy => ask,
        Side::Sell => bid,
    }
}

/// Price an existing position is closed at.
pub fn exit_price(side: Side, bid: f64, ask: f64) -> f64 {
    match side {
        Side::Buy => bid,
        Side::Sell => ask,
    }
}

/// Unrealised PnL marked at the side's exit price.
pub fn floating_pnl(
    side: Side,
    entry_price: f64,
    bid: f64,
    ask: f64,
    lot: f64,
    contract_size: f64,
) -> f64 {
    realized_pnl(side, entry_price, exit_price(side, bid, ask), lot, contract_size)
}

/// PnL locked in by closing `lot` at `close_price`.
pub fn realized_pnl(
    side: Side,
    entry_price: f64,
    close_price: f64,
    lot: f64,
    contract_size: f64,
) -> f64 {
    round_money(side.direction() * (close_price - entry_price) * lot * contract_size)
}

/// `equity / margin * 100`, or 0 when no margin is in use.
pub fn margin_level(equity: f64, margin: f64) -> f64 {
    if margin == 0.0 {
        0.0
    } else {
        equity / margin * 100.0
    }
}

// ---------------------------------------------------------------------------
// Trigger detection
// ---------------------------------------------------------------------------

/// Outcome of an SL/TP evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SltpDecision {
    pub triggered: bool,
    pub reason: Option<CloseReason>,
    /// The side's exit price the decision was evaluated against.
    pub close_price: f64,
}

/// Decide whether a position should be closed by its stop-loss or
/// take-profit.
///
/// BUY positions are evaluated against bid, SELL positions against ask. The
/// stop-loss is checked first and wins if both levels are crossed.
pub fn should_trigger_sltp(
    side: Side,
    bid: f64,
    ask: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> SltpDecision {
    let price = exit_price(side, bid, ask);

    let sl_hit = stop_loss.is_some_and(|sl| match side {
        Side::Buy => price <= sl,
        Side::Sell => price >= sl,
    });
    let tp_hit = take_profit.is_some_and(|tp| match side {
        Side::Buy => price >= tp,
        Side::Sell => price <= tp,
    });

    let reason = if sl_hit {
        Some(CloseReason::StopLoss)
    } else if tp_hit {
        Some(CloseReason::TakeProfit)
    } else {
        None
    };

    SltpDecision {
        triggered: reason.is_some(),
        reason,
        close_price: price,
    }
}

/// Whether a resting order fires at the current quote.
///
/// Buy orders watch ask, sell orders watch bid.
pub fn pending_order_triggered(order_type: OrderType, trigger_price: f64, bid: f64, ask: f64) -> bool {
    match order_type {
        OrderType::BuyLimit => ask <= trigger_price,
        OrderType::SellLimit => bid >= trigger_price,
        OrderType::BuyStop => ask >= trigger_price,
        OrderType::SellStop => bid <= trigger_price,
    }
}

// ---------------------------------------------------------------------------
// Wallet projection
// ---------------------------------------------------------------------------

/// Derived wallet figures for a given balance and open exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalletFigures {
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub floating_profit: f64,
}

/// Apply the wallet formulas:
/// `equity = balance + floating`, `free = equity - margin`,
/// `level = equity / margin * 100`.
pub fn project_wallet(balance: f64, floating_profit: f64, used_margin: f64) -> WalletFigures {
    let floating_profit = round_money(floating_profit);
    let used_margin = round_money(used_margin);
    let equity = round_money(balance + floating_profit);
    WalletFigures {
        equity,
        margin: used_margin,
        free_margin: round_money(equity - used_margin),
        margin_level: margin_level(equity, used_margin),
        floating_profit,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
