// =============================================================================
// Tick Ingestor — buffered trade/quote/depth capture
// =============================================================================
//
// Buffers incoming ticks and flushes them to a sink when a buffer reaches
// 100 items or 5 seconds of age, whichever comes first.  Sequence numbers
// are tracked per symbol purely for gap detection; ticks are never
// reordered.  Top-of-book is derived from quote ticks whenever no explicit
// depth snapshot has been seen for the symbol.
//
// Backpressure: when the sink rejects a batch, the batch is re-enqueued at
// the tail until the buffer reaches twice its flush threshold, after which
// the oldest items are dropped and counted in `dropped_total`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use super::{QuoteTick, SequenceGap, TradeTick};
use crate::clock::SharedClock;

/// Flush when a buffer holds this many items...
const FLUSH_SIZE: usize = 100;
/// ...or when its oldest item is this old.
const FLUSH_AGE_MS: i64 = 5_000;
/// Rolling metrics window.
const METRICS_WINDOW_MS: i64 = 5_000;
/// Gap records retained for observability.
const MAX_GAP_RECORDS: usize = 100;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Destination for flushed tick batches. Implementations must not panic;
/// a `false` return means "batch not persisted, hand it back".
pub trait TickSink: Send + Sync {
    fn persist_trades(&self, batch: &[TradeTick]) -> bool;
    fn persist_quotes(&self, batch: &[QuoteTick]) -> bool;
}

/// Sink that discards batches. Used when tick persistence is disabled.
pub struct NullTickSink;

impl TickSink for NullTickSink {
    fn persist_trades(&self, _batch: &[TradeTick]) -> bool {
        true
    }
    fn persist_quotes(&self, _batch: &[QuoteTick]) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Top of book
// ---------------------------------------------------------------------------

/// Best bid/ask for one symbol.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TopOfBook {
    pub bid: f64,
    pub bid_size: u64,
    pub ask: f64,
    pub ask_size: u64,
    pub ts_ns: i64,
    /// True when this came from an explicit depth snapshot rather than a
    /// quote tick.
    pub from_depth: bool,
}

/// A minimal depth snapshot (levels are (price, size), best first).
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub ts_ns: i64,
    pub bids: Vec<(f64, u64)>,
    pub asks: Vec<(f64, u64)>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counts and latency percentiles over the rolling window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestMetrics {
    pub trades_in_window: usize,
    pub quotes_in_window: usize,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,
    pub gaps_total: u64,
    pub dropped_total: u64,
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

struct Buffers {
    trades: VecDeque<TradeTick>,
    quotes: VecDeque<QuoteTick>,
    depth: VecDeque<DepthSnapshot>,
    trades_oldest_ms: Option<i64>,
    quotes_oldest_ms: Option<i64>,
}

struct Tracking {
    last_seq: HashMap<String, u64>,
    gaps: VecDeque<SequenceGap>,
    gaps_total: u64,
    dropped_total: u64,
    book: HashMap<String, TopOfBook>,
    /// (arrival ms, latency ms) samples inside the metrics window.
    latencies: VecDeque<(i64, f64)>,
    trade_arrivals: VecDeque<i64>,
    quote_arrivals: VecDeque<i64>,
}

/// Buffered tick capture with sequence-gap detection and flush batching.
pub struct TickIngestor {
    clock: SharedClock,
    sink: Box<dyn TickSink>,
    buffers: RwLock<Buffers>,
    tracking: RwLock<Tracking>,
}

impl TickIngestor {
    pub fn new(clock: SharedClock, sink: Box<dyn TickSink>) -> Self {
        Self {
            clock,
            sink,
            buffers: RwLock::new(Buffers {
                trades: VecDeque::new(),
                quotes: VecDeque::new(),
                depth: VecDeque::new(),
                trades_oldest_ms: None,
                quotes_oldest_ms: None,
            }),
            tracking: RwLock::new(Tracking {
                last_seq: HashMap::new(),
                gaps: VecDeque::new(),
                gaps_total: 0,
                dropped_total: 0,
                book: HashMap::new(),
                latencies: VecDeque::new(),
                trade_arrivals: VecDeque::new(),
                quote_arrivals: VecDeque::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    pub fn ingest_trade(&self, tick: TradeTick) {
        let now = self.clock.now_ms();
        self.track_seq(&tick.symbol, tick.seq, now);
        self.record_arrival(now, tick.ts_ns, true);

        {
            let mut bufs = self.buffers.write();
            if bufs.trades.is_empty() {
                bufs.trades_oldest_ms = Some(now);
            }
            bufs.trades.push_back(tick);
        }
        self.maybe_flush(now);
    }

    pub fn ingest_quote(&self, tick: QuoteTick) {
        let now = self.clock.now_ms();
        self.track_seq(&tick.symbol, tick.seq, now);
        self.record_arrival(now, tick.ts_ns, false);

        // Derive top-of-book unless an explicit depth snapshot owns it.
        {
            let mut tracking = self.tracking.write();
            let replace = tracking
                .book
                .get(&tick.symbol)
                .map_or(true, |t| !t.from_depth || t.ts_ns < tick.ts_ns);
            if replace {
                tracking.book.insert(
                    tick.symbol.clone(),
                    TopOfBook {
                        bid: tick.bid,
                        bid_size: tick.bid_size,
                        ask: tick.ask,
                        ask_size: tick.ask_size,
                        ts_ns: tick.ts_ns,
                        from_depth: false,
                    },
                );
            }
        }

        {
            let mut bufs = self.buffers.write();
            if bufs.quotes.is_empty() {
                bufs.quotes_oldest_ms = Some(now);
            }
            bufs.quotes.push_back(tick);
        }
        self.maybe_flush(now);
    }

    pub fn ingest_depth(&self, snapshot: DepthSnapshot) {
        if let (Some(&(bid, bid_size)), Some(&(ask, ask_size))) =
            (snapshot.bids.first(), snapshot.asks.first())
        {
            self.tracking.write().book.insert(
                snapshot.symbol.clone(),
                TopOfBook {
                    bid,
                    bid_size,
                    ask,
                    ask_size,
                    ts_ns: snapshot.ts_ns,
                    from_depth: true,
                },
            );
        }

        let mut bufs = self.buffers.write();
        bufs.depth.push_back(snapshot);
        while bufs.depth.len() > FLUSH_SIZE {
            bufs.depth.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Flush any buffer that is full or too old. Also called from a periodic
    /// supervisor tick so age-based flushes fire without new ticks arriving.
    pub fn maybe_flush(&self, now_ms: i64) {
        let (flush_trades, flush_quotes) = {
            let bufs = self.buffers.read();
            let trades_due = bufs.trades.len() >= FLUSH_SIZE
                || bufs
                    .trades_oldest_ms
                    .is_some_and(|t| now_ms - t >= FLUSH_AGE_MS);
            let quotes_due = bufs.quotes.len() >= FLUSH_SIZE
                || bufs
                    .quotes_oldest_ms
                    .is_some_and(|t| now_ms - t >= FLUSH_AGE_MS);
            (trades_due, quotes_due)
        };

        if flush_trades {
            self.flush_trades(now_ms);
        }
        if flush_quotes {
            self.flush_quotes(now_ms);
        }
    }

    fn flush_trades(&self, now_ms: i64) {
        let batch: Vec<TradeTick> = {
            let mut bufs = self.buffers.write();
            bufs.trades_oldest_ms = None;
            bufs.trades.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        if self.sink.persist_trades(&batch) {
            debug!(count = batch.len(), "trade batch flushed");
            return;
        }

        // Persist failed: re-enqueue at the tail, bounded at 2x the flush
        // threshold, oldest dropped first.
        warn!(count = batch.len(), "trade batch persist failed -- re-enqueued");
        let mut bufs = self.buffers.write();
        for tick in batch {
            bufs.trades.push_back(tick);
        }
        let mut dropped = 0u64;
        while bufs.trades.len() > FLUSH_SIZE * 2 {
            bufs.trades.pop_front();
            dropped += 1;
        }
        bufs.trades_oldest_ms = Some(now_ms);
        drop(bufs);
        if dropped > 0 {
            self.tracking.write().dropped_total += dropped;
            warn!(dropped, "trade buffer overflow -- oldest ticks dropped");
        }
    }

    fn flush_quotes(&self, now_ms: i64) {
        let batch: Vec<QuoteTick> = {
            let mut bufs = self.buffers.write();
            bufs.quotes_oldest_ms = None;
            bufs.quotes.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        if self.sink.persist_quotes(&batch) {
            debug!(count = batch.len(), "quote batch flushed");
            return;
        }

        warn!(count = batch.len(), "quote batch persist failed -- re-enqueued");
        let mut bufs = self.buffers.write();
        for tick in batch {
            bufs.quotes.push_back(tick);
        }
        let mut dropped = 0u64;
        while bufs.quotes.len() > FLUSH_SIZE * 2 {
            bufs.quotes.pop_front();
            dropped += 1;
        }
        bufs.quotes_oldest_ms = Some(now_ms);
        drop(bufs);
        if dropped > 0 {
            self.tracking.write().dropped_total += dropped;
            warn!(dropped, "quote buffer overflow -- oldest ticks dropped");
        }
    }

    // -------------------------------------------------------------------------
    // Tracking helpers
    // -------------------------------------------------------------------------

    fn track_seq(&self, symbol: &str, seq: Option<u64>, now_ms: i64) {
        let Some(seq) = seq else { return };
        let mut tracking = self.tracking.write();

        if let Some(&prev) = tracking.last_seq.get(symbol) {
            if seq > prev + 1 {
                let gap = SequenceGap {
                    symbol: symbol.to_string(),
                    expected: prev + 1,
                    received: seq,
                    size: seq - prev - 1,
                    at_ms: now_ms,
                };
                warn!(
                    symbol,
                    expected = gap.expected,
                    received = gap.received,
                    size = gap.size,
                    "sequence gap detected"
                );
                tracking.gaps.push_back(gap);
                while tracking.gaps.len() > MAX_GAP_RECORDS {
                    tracking.gaps.pop_front();
                }
                tracking.gaps_total += 1;
            }
        }
        tracking.last_seq.insert(symbol.to_string(), seq);
    }

    fn record_arrival(&self, now_ms: i64, ts_ns: i64, is_trade: bool) {
        let latency_ms = (now_ms as f64) - (ts_ns as f64 / 1_000_000.0);
        let mut tracking = self.tracking.write();
        tracking.latencies.push_back((now_ms, latency_ms.max(0.0)));
        if is_trade {
            tracking.trade_arrivals.push_back(now_ms);
        } else {
            tracking.quote_arrivals.push_back(now_ms);
        }

        let cutoff = now_ms - METRICS_WINDOW_MS;
        while tracking.latencies.front().is_some_and(|(t, _)| *t < cutoff) {
            tracking.latencies.pop_front();
        }
        while tracking.trade_arrivals.front().is_some_and(|t| *t < cutoff) {
            tracking.trade_arrivals.pop_front();
        }
        while tracking.quote_arrivals.front().is_some_and(|t| *t < cutoff) {
            tracking.quote_arrivals.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current top-of-book for `symbol`, if any source has produced one.
    pub fn top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        self.tracking.read().book.get(symbol).copied()
    }

    /// Recorded sequence gaps (newest last).
    pub fn gaps(&self) -> Vec<SequenceGap> {
        self.tracking.read().gaps.iter().cloned().collect()
    }

    /// Counts and latency percentiles over the 5-second window.
    pub fn metrics(&self) -> IngestMetrics {
        let tracking = self.tracking.read();
        let mut samples: Vec<f64> = tracking.latencies.iter().map(|(_, l)| *l).collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let pct = |p: f64| -> f64 {
            if samples.is_empty() {
                return 0.0;
            }
            let idx = ((samples.len() as f64 - 1.0) * p).round() as usize;
            samples[idx.min(samples.len() - 1)]
        };

        IngestMetrics {
            trades_in_window: tracking.trade_arrivals.len(),
            quotes_in_window: tracking.quote_arrivals.len(),
            latency_p50_ms: pct(0.50),
            latency_p90_ms: pct(0.90),
            latency_p99_ms: pct(0.99),
            gaps_total: tracking.gaps_total,
            dropped_total: tracking.dropped_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::clock::Clock;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        ok: AtomicBool,
        trade_batches: AtomicUsize,
        quote_batches: AtomicUsize,
    }

    impl CountingSink {
        fn new(ok: bool) -> Arc<Self> {
            Arc::new(Self {
                ok: AtomicBool::new(ok),
                trade_batches: AtomicUsize::new(0),
                quote_batches: AtomicUsize::new(0),
            })
        }
    }

    impl TickSink for Arc<CountingSink> {
        fn persist_trades(&self, _batch: &[TradeTick]) -> bool {
            self.trade_batches.fetch_add(1, Ordering::SeqCst);
            self.ok.load(Ordering::SeqCst)
        }
        fn persist_quotes(&self, _batch: &[QuoteTick]) -> bool {
            self.quote_batches.fetch_add(1, Ordering::SeqCst);
            self.ok.load(Ordering::SeqCst)
        }
    }

    fn trade(symbol: &str, seq: u64, ts_ns: i64) -> TradeTick {
        TradeTick {
            symbol: symbol.into(),
            ts_ns,
            seq: Some(seq),
            price: 5000.0,
            size: 1,
            side: None,
        }
    }

    fn quote(symbol: &str, ts_ns: i64) -> QuoteTick {
        QuoteTick {
            symbol: symbol.into(),
            ts_ns,
            seq: None,
            bid: 4999.75,
            bid_size: 5,
            ask: 5000.0,
            ask_size: 3,
        }
    }

    fn ingestor(ok: bool) -> (TickIngestor, Arc<CountingSink>, Arc<ManualClock>) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 14, 0, 0).unwrap());
        let sink = CountingSink::new(ok);
        let ing = TickIngestor::new(clock.clone(), Box::new(sink.clone()));
        (ing, sink, clock)
    }

    #[test]
    fn size_triggered_flush() {
        let (ing, sink, _clock) = ingestor(true);
        for i in 0..FLUSH_SIZE as u64 {
            ing.ingest_trade(trade("MES", i + 1, i as i64));
        }
        assert_eq!(sink.trade_batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn age_triggered_flush() {
        let (ing, sink, clock) = ingestor(true);
        ing.ingest_trade(trade("MES", 1, 0));
        assert_eq!(sink.trade_batches.load(Ordering::SeqCst), 0);

        clock.advance(Duration::seconds(6));
        ing.maybe_flush(clock.now_ms());
        assert_eq!(sink.trade_batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gap_detection_records_and_continues() {
        let (ing, _sink, _clock) = ingestor(true);
        ing.ingest_trade(trade("MES", 1, 0));
        ing.ingest_trade(trade("MES", 2, 1));
        ing.ingest_trade(trade("MES", 5, 2)); // gap of 2 (seq 3, 4)
        ing.ingest_trade(trade("MES", 6, 3));

        let gaps = ing.gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].expected, 3);
        assert_eq!(gaps[0].received, 5);
        assert_eq!(gaps[0].size, 2);
        assert_eq!(ing.metrics().gaps_total, 1);
    }

    #[test]
    fn gaps_are_per_symbol() {
        let (ing, _sink, _clock) = ingestor(true);
        ing.ingest_trade(trade("MES", 10, 0));
        ing.ingest_trade(trade("MNQ", 1, 0));
        ing.ingest_trade(trade("MNQ", 2, 1));
        assert!(ing.gaps().is_empty());
    }

    #[test]
    fn top_of_book_from_quotes_and_depth() {
        let (ing, _sink, _clock) = ingestor(true);
        ing.ingest_quote(quote("MES", 1_000));
        let tob = ing.top_of_book("MES").unwrap();
        assert!(!tob.from_depth);
        assert!((tob.bid - 4999.75).abs() < 1e-12);

        // Explicit depth takes over.
        ing.ingest_depth(DepthSnapshot {
            symbol: "MES".into(),
            ts_ns: 2_000,
            bids: vec![(4999.5, 10)],
            asks: vec![(5000.25, 8)],
        });
        let tob = ing.top_of_book("MES").unwrap();
        assert!(tob.from_depth);
        assert!((tob.bid - 4999.5).abs() < 1e-12);

        // An older quote does not displace a newer depth book.
        ing.ingest_quote(quote("MES", 1_500));
        assert!(ing.top_of_book("MES").unwrap().from_depth);
    }

    #[test]
    fn failed_flush_reenqueues_then_drops() {
        let (ing, sink, clock) = ingestor(false);
        for i in 0..FLUSH_SIZE as u64 {
            ing.ingest_trade(trade("MES", i + 1, i as i64));
        }
        // Flush attempted and failed; batch back in the buffer.
        assert_eq!(sink.trade_batches.load(Ordering::SeqCst), 1);
        assert_eq!(ing.metrics().dropped_total, 0);

        // Another full batch: buffer would exceed 2x cap, oldest dropped.
        clock.advance(Duration::seconds(6));
        for i in 0..(FLUSH_SIZE as u64 + 10) {
            ing.ingest_trade(trade("MES", 200 + i, i as i64));
        }
        assert!(ing.metrics().dropped_total > 0);
    }

    #[test]
    fn latency_percentiles_cover_window() {
        let (ing, _sink, clock) = ingestor(true);
        let base_ns = clock.now_ms() * 1_000_000;
        for i in 0..10 {
            // Each tick arrives 1ms after its exchange timestamp.
            ing.ingest_quote(quote("MES", base_ns + i * 1_000_000 - 1_000_000));
        }
        let m = ing.metrics();
        assert_eq!(m.quotes_in_window, 10);
        assert!(m.latency_p50_ms >= 0.0);
        assert!(m.latency_p99_ms >= m.latency_p50_ms);
    }
}
