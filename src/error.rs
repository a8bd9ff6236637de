// =============================================================================
// Engine errors: validation, not-found, conflict, collaborator failures
// =============================================================================

use thiserror::Error;

/// Reason string attached to orders cancelled by the pending-order sweep.
pub const INSUFFICIENT_MARGIN_AT_EXECUTION: &str = "insufficient margin at execution time";

/// Errors surfaced by the trade engine's admission and lifecycle operations.
///
/// Sweeps never return these per item; they log and move on. Callers of the
/// lifecycle entry points get the specific reason back.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid lot size {lot}: must be between {min} and {max}")]
    InvalidLot { lot: f64, min: f64, max: f64 },

    #[error("invalid leverage {leverage}: must be between 1 and {max}")]
    InvalidLeverage { leverage: u32, max: u32 },

    #[error("invalid amount {0}: must be a positive number")]
    InvalidAmount(f64),

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("no live price for {0}")]
    PriceUnavailable(String),

    #[error("invalid stops: {0}")]
    InvalidStops(String),

    #[error("invalid trigger price: {0}")]
    InvalidTrigger(String),

    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("insufficient margin: required {required:.2}, free {free:.2}")]
    InsufficientMargin { required: f64, free: f64 },

    #[error("wallet not found for user {0}")]
    WalletNotFound(String),

    #[error("trade {0} not found")]
    TradeNotFound(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("repository error: {0:#}")]
    Repository(#[from] anyhow::Error),
}

impl EngineError {
    /// True for input problems the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidLot { .. }
                | Self::InvalidLeverage { .. }
                | Self::InvalidAmount(_)
                | Self::UnknownSymbol(_)
                | Self::InvalidStops(_)
                | Self::InvalidTrigger(_)
                | Self::InvalidExpiry(_)
                | Self::InsufficientMargin { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
