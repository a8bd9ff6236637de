// =============================================================================
// Quote Client: REST bookTicker fetches with a hard timeout
// =============================================================================
//
// Used to refresh symbols whose streamed quote has gone stale. A failed or
// slow fetch never clears anything: the store keeps its last-known quote and
// the symbol stays stale until a fresh price arrives.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::types::{now_ms, Quote};

use super::{parse_decimal_field, QuoteSink};

/// REST client for single-symbol bookTicker quotes.
#[derive(Clone)]
pub struct QuoteClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl QuoteClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, timeout_ms = timeout.as_millis() as u64, "QuoteClient initialised");

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    /// GET /api/v3/ticker/bookTicker for one symbol.
    #[instrument(skip(self), name = "quote_client::book_ticker")]
    pub async fn book_ticker(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/api/v3/ticker/bookTicker?symbol={}", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/bookTicker request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse bookTicker response")?;

        if !status.is_success() {
            anyhow::bail!("GET /api/v3/ticker/bookTicker returned {}: {}", status, body);
        }

        parse_rest_book_ticker(&body)
    }

    /// Fetch each symbol and push fresh quotes into `sink`. Failures and
    /// timeouts are logged and leave the symbol's last-known quote in place.
    /// Returns how many symbols were refreshed.
    pub async fn refresh(&self, symbols: &[String], sink: &dyn QuoteSink) -> usize {
        let mut refreshed = 0;
        for symbol in symbols {
            match tokio::time::timeout(self.timeout, self.book_ticker(symbol)).await {
                Ok(Ok(quote)) => {
                    sink.on_quote(symbol, quote.bid, quote.ask, now_ms());
                    refreshed += 1;
                }
                Ok(Err(e)) => {
                    warn!(symbol = %symbol, error = %e, "quote refresh failed, keeping last-known price");
                }
                Err(_) => {
                    warn!(
                        symbol = %symbol,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "quote refresh timed out, keeping last-known price"
                    );
                }
            }
        }
        refreshed
    }
}

impl std::fmt::Debug for QuoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Expected shape:
/// ```json
/// { "symbol": "EURUSD", "bidPrice": "1.08500", "askPrice": "1.08520" }
/// ```
fn parse_rest_book_ticker(body: &serde_json::Value) -> Result<Quote> {
    let bid = parse_decimal_field(&body["bidPrice"], "bidPrice")?;
    let ask = parse_decimal_field(&body["askPrice"], "askPrice")?;
    Ok(Quote { bid, ask })
}
