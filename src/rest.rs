// =============================================================================
// RestFetcher — single-shot requests against the rates playground API
// =============================================================================
//
// Fire-and-forget, one round trip per call, no internal retry (retry policy
// belongs to the caller: the poller tick or the session start path).
//
// Numeric parsing is defensive throughout: any non-numeric or non-positive
// price/rate is coerced to 0.0 rather than rejected. Deliberate
// availability-over-correctness rule, applied uniformly.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use tracing::{debug, instrument};

use crate::error::FeedError;
use crate::series::Point;

/// Which endpoint family a request targets. The playground API splits crypto
/// (`{data: {SYM: {price}}}`) and forex (`{rates: {CUR: rate}}`) surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    Crypto,
    Forex,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto => write!(f, "crypto"),
            Self::Forex => write!(f, "forex"),
        }
    }
}

/// REST client for latest/historical quotes and currency conversion.
#[derive(Clone)]
pub struct RestFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl RestFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Current UNIX timestamp in seconds.
    pub fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// GET the latest quotes for `instrument` (comma-separable symbol set).
    ///
    /// Returns one point per symbol, all carrying the current wall-clock
    /// second as `time`.
    #[instrument(skip(self), name = "rest::fetch_latest")]
    pub async fn fetch_latest(
        &self,
        market: Market,
        instrument: &str,
        reference: &str,
    ) -> Result<HashMap<String, Point>, FeedError> {
        let url = match market {
            Market::Crypto => format!(
                "{}/crypto/latest?symbols={}",
                self.base_url,
                instrument.to_uppercase()
            ),
            Market::Forex => format!(
                "{}/forex/latest?base={}&symbols={}",
                self.base_url,
                reference.to_uppercase(),
                instrument.to_uppercase()
            ),
        };

        let body = self.get_json(&url).await?;
        let points = normalize_points(&body, Self::now_secs());
        debug!(market = %market, count = points.len(), "latest quotes fetched");
        Ok(points)
    }

    /// GET quotes for `instrument` on a specific date. Points carry midnight
    /// UTC of the requested date as `time`.
    #[instrument(skip(self), name = "rest::fetch_historical")]
    pub async fn fetch_historical(
        &self,
        market: Market,
        instrument: &str,
        reference: &str,
        date: NaiveDate,
    ) -> Result<HashMap<String, Point>, FeedError> {
        let date_str = date.format("%Y-%m-%d");
        let url = match market {
            Market::Crypto => format!(
                "{}/crypto/historical?date_str={}&symbols={}",
                self.base_url,
                date_str,
                instrument.to_uppercase()
            ),
            Market::Forex => format!(
                "{}/forex/historical?date_str={}&base={}&symbols={}",
                self.base_url,
                date_str,
                reference.to_uppercase(),
                instrument.to_uppercase()
            ),
        };

        let time = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);

        let body = self.get_json(&url).await?;
        let points = normalize_points(&body, time);
        debug!(market = %market, %date_str, count = points.len(), "historical quotes fetched");
        Ok(points)
    }

    // -------------------------------------------------------------------------
    // Conversion
    // -------------------------------------------------------------------------

    /// GET /forex/convert — convert `amount` from one currency to another.
    #[instrument(skip(self), name = "rest::convert")]
    pub async fn convert(
        &self,
        amount: f64,
        from_currency: &str,
        to_currency: &str,
    ) -> Result<f64, FeedError> {
        let url = format!(
            "{}/forex/convert?amount={}&from_currency={}&to_currency={}",
            self.base_url,
            amount,
            from_currency.to_uppercase(),
            to_currency.to_uppercase()
        );

        let body = self.get_json(&url).await?;
        let result = coerce_value(&body["result"]);
        debug!(amount, from_currency, to_currency, result, "conversion fetched");
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FeedError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::fetch(format!("GET {url} failed"), e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::fetch_other(format!(
                "GET {url} returned {status}"
            )));
        }

        resp.json()
            .await
            .map_err(|e| FeedError::fetch(format!("GET {url} returned invalid JSON"), e))
    }
}

impl std::fmt::Debug for RestFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestFetcher")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Extract `symbol -> Point` from either response family:
/// crypto `{data: {SYM: {price: n}}}` or forex `{rates: {CUR: n}}`.
fn normalize_points(body: &serde_json::Value, time: i64) -> HashMap<String, Point> {
    let mut out = HashMap::new();

    if let Some(data) = body["data"].as_object() {
        for (symbol, entry) in data {
            out.insert(
                symbol.to_uppercase(),
                Point::new(time, coerce_value(&entry["price"])),
            );
        }
    } else if let Some(rates) = body["rates"].as_object() {
        for (currency, rate) in rates {
            out.insert(currency.to_uppercase(), Point::new(time, coerce_value(rate)));
        }
    }

    out
}

/// Parse a JSON value that may be a number or a numeric string. Anything
/// non-numeric, non-finite, or non-positive becomes `0.0`.
pub(crate) fn coerce_value(val: &serde_json::Value) -> f64 {
    let parsed = match val {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn coerce_value_accepts_numbers_and_numeric_strings() {
        assert_eq!(coerce_value(&json!(42.5)), 42.5);
        assert_eq!(coerce_value(&json!("37000.25")), 37000.25);
    }

    #[test]
    fn coerce_value_rejects_garbage_to_zero() {
        assert_eq!(coerce_value(&json!("not a number")), 0.0);
        assert_eq!(coerce_value(&json!(null)), 0.0);
        assert_eq!(coerce_value(&json!(-5.0)), 0.0);
        assert_eq!(coerce_value(&json!(0.0)), 0.0);
        assert_eq!(coerce_value(&json!({"nested": true})), 0.0);
    }

    #[test]
    fn normalize_handles_both_response_families() {
        let crypto = json!({"success": true, "data": {"BTC": {"price": 42000.5}}});
        let points = normalize_points(&crypto, 100);
        assert_eq!(points["BTC"], Point::new(100, 42000.5));

        let forex = json!({"success": true, "base": "USD", "rates": {"eur": 0.91, "IDR": 15600.0}});
        let points = normalize_points(&forex, 200);
        assert_eq!(points["EUR"], Point::new(200, 0.91));
        assert_eq!(points["IDR"], Point::new(200, 15600.0));
    }

    #[tokio::test]
    async fn fetch_latest_crypto() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crypto/latest"))
            .and(query_param("symbols", "BTC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "timestamp": 1700000000,
                "data": {"BTC": {"price": 42000.5, "change_24h": 2.5}}
            })))
            .mount(&server)
            .await;

        let fetcher = RestFetcher::new(server.uri());
        let points = fetcher
            .fetch_latest(Market::Crypto, "btc", "USD")
            .await
            .unwrap();
        assert_eq!(points["BTC"].value, 42000.5);
        assert!(points["BTC"].time > 0);
    }

    #[tokio::test]
    async fn fetch_historical_forex_uses_midnight_utc() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forex/historical"))
            .and(query_param("date_str", "2024-01-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "base": "USD",
                "date": "2024-01-01",
                "rates": {"EUR": 0.9, "IDR": 15400.0}
            })))
            .mount(&server)
            .await;

        let fetcher = RestFetcher::new(server.uri());
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let points = fetcher
            .fetch_historical(Market::Forex, "EUR,IDR", "USD", date)
            .await
            .unwrap();

        // 2024-01-01T00:00:00Z
        assert_eq!(points["EUR"].time, 1_704_067_200);
        assert_eq!(points["EUR"].value, 0.9);
        assert_eq!(points["IDR"].value, 15400.0);
    }

    #[tokio::test]
    async fn non_2xx_surfaces_as_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crypto/latest"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = RestFetcher::new(server.uri());
        let err = fetcher
            .fetch_latest(Market::Crypto, "BTC", "USD")
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Fetch { .. }));
    }

    #[tokio::test]
    async fn convert_returns_result_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forex/convert"))
            .and(query_param("from_currency", "USD"))
            .and(query_param("to_currency", "IDR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "amount": 100.0,
                "from": "USD",
                "to": "IDR",
                "rate": 15600.0,
                "result": 1560000.0,
                "date": "2024-01-01"
            })))
            .mount(&server)
            .await;

        let fetcher = RestFetcher::new(server.uri());
        let result = fetcher.convert(100.0, "usd", "idr").await.unwrap();
        assert_eq!(result, 1_560_000.0);
    }
}
