// =============================================================================
// Market data — bars, ticks, and timeframe aggregation
// =============================================================================

mod bar_buffer;
pub mod router;
pub mod stream;
pub mod tick_ingestor;

pub use bar_buffer::BarBuffer;

use serde::{Deserialize, Serialize};

use crate::types::TradeSide;

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// A single OHLCV bar. Timestamps are integer milliseconds since the UNIX
/// epoch and refer to the bar's open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_event: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// OHLC sanity: high dominates both open and close, low is dominated by
    /// both.
    pub fn is_valid(&self) -> bool {
        let body_hi = self.open.max(self.close);
        let body_lo = self.open.min(self.close);
        self.high >= body_hi && self.low <= body_lo
    }
}

/// Composite key that identifies a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: String,
}

impl BarKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }

    /// 1-minute series for `symbol`, the base timeframe everywhere.
    pub fn one_minute(symbol: impl Into<String>) -> Self {
        Self::new(symbol, "1m")
    }
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol, self.timeframe)
    }
}

/// Parse a timeframe label ("1m", "5m", "15m", "1h", "4h", "1d") into
/// minutes. Unknown labels return `None` so callers can fail closed.
pub fn timeframe_minutes(tf: &str) -> Option<i64> {
    match tf {
        "1m" => Some(1),
        "3m" => Some(3),
        "5m" => Some(5),
        "15m" => Some(15),
        "30m" => Some(30),
        "1h" => Some(60),
        "4h" => Some(240),
        "1d" => Some(1440),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Timeframe aggregation
// ---------------------------------------------------------------------------

/// Reduce base-timeframe bars into a higher timeframe.
///
/// Bars are grouped into time-aligned chunks of `multiplier` source
/// intervals (open = first, close = last, high = max, low = min,
/// volume = sum). Only complete chunks are emitted: a chunk missing any of
/// its source bars is dropped, so re-running the aggregation over the same
/// input always yields identical output.
///
/// `src_interval_ms` is the duration of one source bar.
pub fn aggregate_bars(bars: &[Bar], src_interval_ms: i64, multiplier: usize) -> Vec<Bar> {
    if bars.is_empty() || multiplier == 0 || src_interval_ms <= 0 {
        return Vec::new();
    }
    if multiplier == 1 {
        return bars.to_vec();
    }

    let dst_interval_ms = src_interval_ms * multiplier as i64;
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len() / multiplier);

    let mut chunk: Vec<&Bar> = Vec::with_capacity(multiplier);
    let mut chunk_start: Option<i64> = None;

    let mut flush = |chunk: &mut Vec<&Bar>, chunk_start: &mut Option<i64>, out: &mut Vec<Bar>| {
        if let Some(start) = *chunk_start {
            // Complete chunks only.
            if chunk.len() == multiplier {
                let open = chunk[0].open;
                let close = chunk[chunk.len() - 1].close;
                let high = chunk.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                let low = chunk.iter().map(|b| b.low).fold(f64::MAX, f64::min);
                let volume = chunk.iter().map(|b| b.volume).sum();
                out.push(Bar {
                    ts_event: start,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
            }
        }
        chunk.clear();
        *chunk_start = None;
    };

    for bar in bars {
        let aligned = (bar.ts_event / dst_interval_ms) * dst_interval_ms;
        if chunk_start != Some(aligned) {
            flush(&mut chunk, &mut chunk_start, &mut out);
            chunk_start = Some(aligned);
        }
        chunk.push(bar);
    }
    flush(&mut chunk, &mut chunk_start, &mut out);

    out
}

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

/// A single trade print from the streaming feed. `ts_ns` is the exchange
/// timestamp in nanoseconds, monotonic within a symbol stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: String,
    pub ts_ns: i64,
    #[serde(default)]
    pub seq: Option<u64>,
    pub price: f64,
    pub size: u64,
    #[serde(default)]
    pub side: Option<TradeSide>,
}

/// A top-of-book quote from the streaming feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteTick {
    pub symbol: String,
    pub ts_ns: i64,
    #[serde(default)]
    pub seq: Option<u64>,
    pub bid: f64,
    pub bid_size: u64,
    pub ask: f64,
    pub ask_size: u64,
}

impl QuoteTick {
    /// Midpoint of the current bid/ask.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// A gap detected in a symbol's sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceGap {
    pub symbol: String,
    pub expected: u64,
    pub received: u64,
    pub size: u64,
    pub at_ms: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts_min: i64, open: f64, high: f64, low: f64, close: f64, vol: u64) -> Bar {
        Bar {
            ts_event: ts_min * 60_000,
            open,
            high,
            low,
            close,
            volume: vol,
        }
    }

    #[test]
    fn bar_validation() {
        assert!(bar(0, 10.0, 12.0, 9.0, 11.0, 1).is_valid());
        // High below close.
        assert!(!bar(0, 10.0, 10.5, 9.0, 11.0, 1).is_valid());
        // Low above open.
        assert!(!bar(0, 10.0, 12.0, 10.5, 11.0, 1).is_valid());
    }

    #[test]
    fn timeframe_parsing() {
        assert_eq!(timeframe_minutes("1m"), Some(1));
        assert_eq!(timeframe_minutes("5m"), Some(5));
        assert_eq!(timeframe_minutes("1h"), Some(60));
        assert_eq!(timeframe_minutes("7m"), None);
    }

    #[test]
    fn aggregate_five_one_minute_bars() {
        let bars: Vec<Bar> = (0..5)
            .map(|i| bar(i, 100.0 + i as f64, 101.0 + i as f64, 99.0 + i as f64, 100.5 + i as f64, 10))
            .collect();
        let out = aggregate_bars(&bars, 60_000, 5);
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert_eq!(b.ts_event, 0);
        assert!((b.open - 100.0).abs() < 1e-12);
        assert!((b.close - 104.5).abs() < 1e-12);
        assert!((b.high - 105.0).abs() < 1e-12);
        assert!((b.low - 99.0).abs() < 1e-12);
        assert_eq!(b.volume, 50);
    }

    #[test]
    fn aggregate_drops_incomplete_chunks() {
        // 7 bars: one complete 5-bar chunk, one incomplete 2-bar tail.
        let bars: Vec<Bar> = (0..7).map(|i| bar(i, 1.0, 2.0, 0.5, 1.5, 1)).collect();
        let out = aggregate_bars(&bars, 60_000, 5);
        assert_eq!(out.len(), 1);

        // A chunk with a missing interior bar is also incomplete.
        let mut gappy: Vec<Bar> = (0..5).map(|i| bar(i, 1.0, 2.0, 0.5, 1.5, 1)).collect();
        gappy.remove(2);
        let out = aggregate_bars(&gappy, 60_000, 5);
        assert!(out.is_empty());
    }

    #[test]
    fn aggregate_is_deterministic() {
        let bars: Vec<Bar> = (0..25)
            .map(|i| bar(i, 10.0 + (i % 3) as f64, 13.0, 9.0, 11.0, 2))
            .collect();
        let once = aggregate_bars(&bars, 60_000, 5);
        let twice = aggregate_bars(&bars, 60_000, 5);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 5);
    }

    #[test]
    fn aggregate_respects_alignment() {
        // Bars starting at minute 3 — the first chunk (minutes 0-4) is
        // incomplete and must be dropped; minutes 5-9 form the first output.
        let bars: Vec<Bar> = (3..12).map(|i| bar(i, 1.0, 2.0, 0.5, 1.5, 1)).collect();
        let out = aggregate_bars(&bars, 60_000, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ts_event, 5 * 60_000);
    }

    #[test]
    fn multiplier_one_is_identity() {
        let bars: Vec<Bar> = (0..3).map(|i| bar(i, 1.0, 2.0, 0.5, 1.5, 1)).collect();
        assert_eq!(aggregate_bars(&bars, 60_000, 1), bars);
    }

    #[test]
    fn quote_mid() {
        let q = QuoteTick {
            symbol: "MES".into(),
            ts_ns: 0,
            seq: None,
            bid: 5000.0,
            bid_size: 3,
            ask: 5000.5,
            ask_size: 2,
        };
        assert!((q.mid() - 5000.25).abs() < 1e-12);
    }
}
