// =============================================================================
// Shared types used across the B-book engine
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction. BUY exits at bid, SELL exits at ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for BUY, -1 for SELL.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("invalid side '{other}'")),
        }
    }
}

/// Life-cycle of a trade: Open -> Partial* -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Partial,
    Closed,
}

impl TradeStatus {
    /// Open and partially-closed trades still carry exposure.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Partial => write!(f, "partial"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Resting order types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
}

impl OrderType {
    pub fn side(self) -> Side {
        match self {
            Self::BuyLimit | Self::BuyStop => Side::Buy,
            Self::SellLimit | Self::SellStop => Side::Sell,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyLimit => write!(f, "buy_limit"),
            Self::SellLimit => write!(f, "sell_limit"),
            Self::BuyStop => write!(f, "buy_stop"),
            Self::SellStop => write!(f, "sell_stop"),
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy_limit" => Ok(Self::BuyLimit),
            "sell_limit" => Ok(Self::SellLimit),
            "buy_stop" => Ok(Self::BuyStop),
            "sell_stop" => Ok(Self::SellStop),
            other => Err(format!("invalid order type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Executed,
    Cancelled,
    Expired,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executed => write!(f, "executed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Why a trade (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "MANUAL")]
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::TakeProfit => write!(f, "TP"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Market session label attached to closed trades, bucketed by UTC hour.
///
/// London takes the London/New York overlap; hour 21 falls between the New
/// York close and the Sydney open.
///
/// | UTC hour | session  |
/// |----------|----------|
/// | 08–15    | London   |
/// | 16–20    | New York |
/// | 00–07    | Tokyo    |
/// | 22–23    | Sydney   |
/// | 21       | Other    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingSession {
    London,
    #[serde(rename = "New York")]
    NewYork,
    Tokyo,
    Sydney,
    Other,
}

impl TradingSession {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            8..=15 => Self::London,
            16..=20 => Self::NewYork,
            0..=7 => Self::Tokyo,
            22..=23 => Self::Sydney,
            _ => Self::Other,
        }
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self::from_hour(time.hour())
    }
}

impl std::fmt::Display for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::London => write!(f, "London"),
            Self::NewYork => write!(f, "New York"),
            Self::Tokyo => write!(f, "Tokyo"),
            Self::Sydney => write!(f, "Sydney"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// A single price observation fed into the candle pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    /// Feed time, milliseconds since the UNIX epoch.
    pub time: i64,
}

/// Quote update consumed by the instrument store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub time: i64,
}

/// Bid/ask pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
