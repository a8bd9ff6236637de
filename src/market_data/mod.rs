pub mod candle_builder;
pub mod instrument_store;
pub mod price_feed;
pub mod quote_client;

use anyhow::{Context, Result};

// Re-exports for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_builder::{Candle, CandleBuilder, Timeframe};
pub use instrument_store::{Instrument, InstrumentStatus, InstrumentStore};
pub use price_feed::{PriceFeed, QuoteSink};
pub use quote_client::QuoteClient;

/// Read a price field that upstream may send either as a decimal string
/// (`"1.10012"`) or as a JSON number.
pub(crate) fn parse_decimal_field(val: &serde_json::Value, name: &str) -> Result<f64> {
    let parsed = match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        serde_json::Value::Null => anyhow::bail!("missing field {name}"),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    };
    if !parsed.is_finite() {
        anyhow::bail!("field {name} is not finite: {parsed}");
    }
    Ok(parsed)
}
