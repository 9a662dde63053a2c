// =============================================================================
// Remote Hydrator — historical bars from the external data API
// =============================================================================
//
// A thin fetcher with a per-request timeout and structured error codes.
// Transient failures (network, timeout, 5xx) are retried with capped
// exponential backoff; client errors are not.
// =============================================================================

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::market_data::Bar;

/// Request timeout for a single fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Transient failures are retried this many times.
const MAX_ATTEMPTS: u32 = 3;
/// First backoff delay; doubles per attempt.
const BACKOFF_BASE_MS: u64 = 250;

/// Structured failure codes from the hydrator.
#[derive(Debug, Error)]
pub enum HydratorError {
    #[error("request timed out")]
    Timeout,
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("network error: {0}")]
    Network(String),
}

impl HydratorError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status(code) => *code >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Wire shape of the data API response.
#[derive(Debug, Deserialize)]
struct FetchResponse {
    bars: Vec<WireBar>,
    #[serde(default)]
    latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireBar {
    ts: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: u64,
}

impl From<WireBar> for Bar {
    fn from(w: WireBar) -> Self {
        Bar {
            ts_event: w.ts,
            open: w.o,
            high: w.h,
            low: w.l,
            close: w.c,
            volume: w.v,
        }
    }
}

fn parse_fetch_response(body: &str) -> Result<(Vec<Bar>, Option<u64>), HydratorError> {
    let resp: FetchResponse =
        serde_json::from_str(body).map_err(|e| HydratorError::Decode(e.to_string()))?;
    Ok((resp.bars.into_iter().map(Bar::from).collect(), resp.latency_ms))
}

/// Idempotent fetcher for historical bars.
#[derive(Clone)]
pub struct RemoteHydrator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteHydrator {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    /// Fetch `timeframe` bars for `[start_ms, end_ms]`, ascending.
    pub async fn fetch(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        timeframe: &str,
    ) -> Result<Vec<Bar>, HydratorError> {
        let url = format!(
            "{}/bars?symbol={}&start={}&end={}&tf={}",
            self.base_url, symbol, start_ms, end_ms, timeframe
        );

        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                HydratorError::Timeout
            } else {
                HydratorError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HydratorError::Status(status.as_u16()));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| HydratorError::Network(e.to_string()))?;

        let (bars, latency_ms) = parse_fetch_response(&body)?;
        debug!(
            symbol,
            timeframe,
            count = bars.len(),
            latency_ms = latency_ms.unwrap_or(0),
            "historical bars fetched"
        );
        Ok(bars)
    }

    /// [`fetch`](Self::fetch) with capped exponential backoff on transient
    /// failures. Client errors fail immediately.
    pub async fn fetch_with_retry(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        timeframe: &str,
    ) -> Result<Vec<Bar>, HydratorError> {
        let mut delay = Duration::from_millis(BACKOFF_BASE_MS);
        let mut last_err = HydratorError::Network("no attempt made".into());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch(symbol, start_ms, end_ms, timeframe).await {
                Ok(bars) => return Ok(bars),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(symbol, attempt, error = %e, "transient fetch failure -- backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HydratorError::Timeout.is_transient());
        assert!(HydratorError::Network("reset".into()).is_transient());
        assert!(HydratorError::Status(503).is_transient());
        assert!(!HydratorError::Status(404).is_transient());
        assert!(!HydratorError::Status(400).is_transient());
        assert!(!HydratorError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn parse_valid_response() {
        let body = r#"{
            "bars": [
                { "ts": 60000, "o": 100.0, "h": 101.0, "l": 99.5, "c": 100.5, "v": 12 },
                { "ts": 120000, "o": 100.5, "h": 102.0, "l": 100.0, "c": 101.5, "v": 9 }
            ],
            "latency_ms": 42
        }"#;
        let (bars, latency) = parse_fetch_response(body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].ts_event, 60_000);
        assert!((bars[1].close - 101.5).abs() < 1e-12);
        assert_eq!(bars[1].volume, 9);
        assert_eq!(latency, Some(42));
    }

    #[test]
    fn parse_rejects_malformed_body() {
        let err = parse_fetch_response("{\"bars\": \"nope\"}").unwrap_err();
        assert!(matches!(err, HydratorError::Decode(_)));
        assert!(parse_fetch_response("not json at all").is_err());
    }

    #[test]
    fn parse_empty_bars() {
        let (bars, latency) = parse_fetch_response(r#"{ "bars": [] }"#).unwrap();
        assert!(bars.is_empty());
        assert_eq!(latency, None);
    }
}
