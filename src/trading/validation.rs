// =============================================================================
// Admission checks for trades and pending orders
// =============================================================================
//
// Every check rejects with a specific `EngineError`; nothing is clamped.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};
use crate::types::{OrderType, Quote, Side};

/// Lot and leverage bounds enforced at admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradingLimits {
    pub min_lot: f64,
    pub max_lot: f64,
    pub default_leverage: u32,
    pub max_leverage: u32,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            min_lot: 0.01,
            max_lot: 100.0,
            default_leverage: 100,
            max_leverage: 500,
        }
    }
}

impl TradingLimits {
    pub fn validate_lot(&self, lot: f64) -> EngineResult<()> {
        if !lot.is_finite() || lot < self.min_lot || lot > self.max_lot {
            return Err(EngineError::InvalidLot {
                lot,
                min: self.min_lot,
                max: self.max_lot,
            });
        }
        Ok(())
    }

    /// Resolve the requested leverage, falling back to the default.
    pub fn resolve_leverage(&self, requested: Option<u32>) -> EngineResult<u32> {
        let leverage = requested.unwrap_or(self.default_leverage);
        if leverage == 0 || leverage > self.max_leverage {
            return Err(EngineError::InvalidLeverage {
                leverage,
                max: self.max_leverage,
            });
        }
        Ok(leverage)
    }
}

pub fn validate_amount(amount: f64) -> EngineResult<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::InvalidAmount(amount));
    }
    Ok(())
}

fn valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// Stop-loss and take-profit must sit on the losing and winning side of
/// `reference` respectively: BUY has SL below and TP above, SELL mirrored.
pub fn validate_stops(
    side: Side,
    reference: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> EngineResult<()> {
    if let Some(sl) = stop_loss {
        if !valid_price(sl) {
            return Err(EngineError::InvalidStops(format!("stop loss {sl} is not a valid price")));
        }
        let ok = match side {
            Side::Buy => sl < reference,
            Side::Sell => sl > reference,
        };
        if !ok {
            let rel = if side == Side::Buy { "below" } else { "above" };
            return Err(EngineError::InvalidStops(format!(
                "{side} stop loss {sl} must be {rel} {reference}"
            )));
        }
    }
    if let Some(tp) = take_profit {
        if !valid_price(tp) {
            return Err(EngineError::InvalidStops(format!("take profit {tp} is not a valid price")));
        }
        let ok = match side {
            Side::Buy => tp > reference,
            Side::Sell => tp < reference,
        };
        if !ok {
            let rel = if side == Side::Buy { "above" } else { "below" };
            return Err(EngineError::InvalidStops(format!(
                "{side} take profit {tp} must be {rel} {reference}"
            )));
        }
    }
    Ok(())
}

/// A new order must not be triggerable at the current quote: limits rest
/// on the favourable side of the market, stops on the other.
pub fn validate_trigger(order_type: OrderType, trigger: f64, quote: Quote) -> EngineResult<()> {
    if !valid_price(trigger) {
        return Err(EngineError::InvalidTrigger(format!("{trigger} is not a valid price")));
    }
    let (ok, rule) = match order_type {
        OrderType::BuyLimit => (trigger < quote.ask, format!("below ask {}", quote.ask)),
        OrderType::SellLimit => (trigger > quote.bid, format!("above bid {}", quote.bid)),
        OrderType::BuyStop => (trigger > quote.ask, format!("above ask {}", quote.ask)),
        OrderType::SellStop => (trigger < quote.bid, format!("below bid {}", quote.bid)),
    };
    if !ok {
        return Err(EngineError::InvalidTrigger(format!(
            "{order_type} trigger {trigger} must be {rule}"
        )));
    }
    Ok(())
}

pub fn validate_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> EngineResult<()> {
    match expires_at {
        Some(at) if at <= now => Err(EngineError::InvalidExpiry(format!(
            "{} is not in the future",
            at.to_rfc3339()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const QUOTE: Quote = Quote {
        bid: 1.1000,
        ask: 1.1002,
    };

    #[test]
    fn lot_bounds_are_inclusive() {
        let limits = TradingLimits::default();
        assert!(limits.validate_lot(0.01).is_ok());
        assert!(limits.validate_lot(100.0).is_ok());
        assert!(matches!(limits.validate_lot(0.0), Err(EngineError::InvalidLot { .. })));
        assert!(limits.validate_lot(100.5).is_err());
        assert!(limits.validate_lot(f64::NAN).is_err());
    }

    #[test]
    fn leverage_defaults_and_bounds() {
        let limits = TradingLimits::default();
        assert_eq!(limits.resolve_leverage(None).unwrap(), 100);
        assert_eq!(limits.resolve_leverage(Some(500)).unwrap(), 500);
        assert!(limits.resolve_leverage(Some(0)).is_err());
        assert!(limits.resolve_leverage(Some(501)).is_err());
    }

    #[test]
    fn stops_follow_side() {
        assert!(validate_stops(Side::Buy, 1.1, Some(1.09), Some(1.12)).is_ok());
        assert!(validate_stops(Side::Buy, 1.1, Some(1.11), None).is_err());
        assert!(validate_stops(Side::Buy, 1.1, None, Some(1.09)).is_err());
        assert!(validate_stops(Side::Sell, 1.1, Some(1.11), Some(1.09)).is_ok());
        assert!(validate_stops(Side::Sell, 1.1, Some(1.09), None).is_err());
        assert!(validate_stops(Side::Sell, 1.1, None, Some(-1.0)).is_err());
        assert!(validate_stops(Side::Buy, 1.1, None, None).is_ok());
    }

    #[test]
    fn trigger_sides() {
        assert!(validate_trigger(OrderType::BuyLimit, 1.0990, QUOTE).is_ok());
        assert!(validate_trigger(OrderType::BuyLimit, 1.1002, QUOTE).is_err());
        assert!(validate_trigger(OrderType::SellLimit, 1.1010, QUOTE).is_ok());
        assert!(validate_trigger(OrderType::SellLimit, 1.0990, QUOTE).is_err());
        assert!(validate_trigger(OrderType::BuyStop, 1.1010, QUOTE).is_ok());
        assert!(validate_trigger(OrderType::BuyStop, 1.0990, QUOTE).is_err());
        assert!(validate_trigger(OrderType::SellStop, 1.0990, QUOTE).is_ok());
        assert!(validate_trigger(OrderType::SellStop, 1.1001, QUOTE).is_err());
        assert!(validate_trigger(OrderType::SellStop, 0.0, QUOTE).is_err());
    }

    #[test]
    fn expiry_must_be_in_the_future() {
        let now = Utc::now();
        assert!(validate_expiry(None, now).is_ok());
        assert!(validate_expiry(Some(now + Duration::minutes(5)), now).is_ok());
        assert!(validate_expiry(Some(now), now).is_err());
    }

    #[test]
    fn amount_must_be_positive() {
        assert!(validate_amount(10.0).is_ok());
        assert!(validate_amount(0.0).is_err());
        assert!(validate_amount(f64::INFINITY).is_err());
    }
}
