// =============================================================================
// ConversionPipeline — derived cross-rate prices
// =============================================================================
//
// Composes two independent sources: a crypto quote denominated in the
// reference currency and a forex conversion into the target currency. The
// feeds do not natively price e.g. BTC in IDR; this pipeline does.
//
// Availability is favored over strict correctness: when the conversion leg
// fails or returns a non-positive amount, the unconverted reference price is
// returned instead of failing the whole derivation.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::FeedError;
use crate::rest::{Market, RestFetcher};
use crate::series::Point;

pub struct ConversionPipeline {
    fetcher: Arc<RestFetcher>,
}

impl ConversionPipeline {
    pub fn new(fetcher: Arc<RestFetcher>) -> Self {
        Self { fetcher }
    }

    /// Latest price of `instrument` expressed in `target`, derived from a
    /// quote in `reference` plus a currency conversion. The quote leg goes to
    /// the instrument's own endpoint family (`market`).
    ///
    /// Identity case (`target == reference`) returns the raw quote. The
    /// result's `time` is the current wall-clock second. Usable directly as a
    /// poller tick; also invoked once eagerly when a cross-rate session
    /// starts, so the chart is never empty on first render when data exists.
    pub async fn derive_price(
        &self,
        market: Market,
        instrument: &str,
        reference: &str,
        target: &str,
    ) -> Result<Point, FeedError> {
        let instrument = instrument.to_uppercase();
        let points = self
            .fetcher
            .fetch_latest(market, &instrument, reference)
            .await?;

        let quote = points.get(&instrument).copied().ok_or_else(|| {
            FeedError::fetch_other(format!("no quote for {instrument} in latest response"))
        })?;

        if target.eq_ignore_ascii_case(reference) {
            return Ok(quote);
        }

        // A zero quote is already the coerced no-data value; converting it
        // would only round-trip a guaranteed-rejected amount.
        if quote.value <= 0.0 {
            return Ok(quote);
        }

        match self.fetcher.convert(quote.value, reference, target).await {
            Ok(amount) if amount > 0.0 => {
                debug!(%instrument, reference, target, amount, "cross-rate derived");
                Ok(Point::new(quote.time, amount))
            }
            Ok(amount) => {
                let e = FeedError::ConversionUnavailable(format!(
                    "non-positive conversion result {amount} for {reference}->{target}"
                ));
                warn!(error = %e, "falling back to unconverted reference price");
                Ok(quote)
            }
            Err(e) => {
                let e = FeedError::ConversionUnavailable(e.to_string());
                warn!(error = %e, "falling back to unconverted reference price");
                Ok(quote)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
