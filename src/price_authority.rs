// =============================================================================
// Price Authority — single source of truth for the freshest mark
// =============================================================================
//
// Every P&L display and every entry evaluation consults the same verdict:
// a Mark with an explicit source and freshness status.  Preference order is
// quote tick, then the latest streamed bar close, then the warm-cache tail.
// When no source is fresh the best stale candidate is returned (same
// preference order) so callers can show *why* they are frozen.
//
// Decision invariant: nothing computes or displays position P&L, and no
// entry is evaluated, unless the mark status is FRESH.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::cache::WarmCache;
use crate::clock::SharedClock;
use crate::ledger::Ledger;
use crate::market_data::router::LiveDataRouter;
use crate::market_data::{timeframe_minutes, BarKey};
use crate::types::TradeSide;

/// Where a mark's price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkSource {
    Quote,
    Bar,
    Cache,
    None,
}

/// Freshness verdict for a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkStatus {
    Fresh,
    Stale,
    Unknown,
}

/// The freshest price believed to be tradable, with provenance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Mark {
    pub price: Option<f64>,
    pub timestamp: Option<i64>,
    pub source: MarkSource,
    pub status: MarkStatus,
    pub age_ms: Option<i64>,
}

impl Mark {
    pub fn unknown() -> Self {
        Self {
            price: None,
            timestamp: None,
            source: MarkSource::None,
            status: MarkStatus::Unknown,
            age_ms: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.status == MarkStatus::Fresh
    }
}

/// Freeze decision handed to runners and the broadcast layer.
#[derive(Debug, Clone, Serialize)]
pub struct FreezeVerdict {
    pub frozen: bool,
    pub reason: Option<String>,
    pub mark: Mark,
}

/// Single authority for mark freshness and trading freezes.
pub struct PriceAuthority {
    clock: SharedClock,
    router: Arc<LiveDataRouter>,
    warm: Arc<WarmCache>,
    ledger: Ledger,
    quote_fresh_ms: i64,
    bar_fresh_multiplier: i64,
    autonomy_halt_ms: i64,
    /// Last time any symbol produced a FRESH mark; seeded at startup.
    last_fresh_ms: AtomicI64,
}

impl PriceAuthority {
    pub fn new(
        clock: SharedClock,
        router: Arc<LiveDataRouter>,
        warm: Arc<WarmCache>,
        ledger: Ledger,
        quote_fresh_secs: u64,
        bar_fresh_multiplier: u64,
        autonomy_halt_secs: u64,
    ) -> Arc<Self> {
        let started = clock.now_ms();
        Arc::new(Self {
            clock,
            router,
            warm,
            ledger,
            quote_fresh_ms: (quote_fresh_secs as i64) * 1_000,
            bar_fresh_multiplier: bar_fresh_multiplier as i64,
            autonomy_halt_ms: (autonomy_halt_secs as i64) * 1_000,
            last_fresh_ms: AtomicI64::new(started),
        })
    }

    // -------------------------------------------------------------------------
    // Mark resolution
    // -------------------------------------------------------------------------

    /// Resolve the mark for `symbol` at `timeframe`.
    pub fn get_mark(&self, symbol: &str, timeframe: &str) -> Mark {
        let now = self.clock.now_ms();
        let interval_ms = timeframe_minutes(timeframe).unwrap_or(1) * 60_000;
        let bar_fresh_ms = self.bar_fresh_multiplier * interval_ms;

        let mut candidates: Vec<Mark> = Vec::with_capacity(3);

        // 1. Most recent quote tick.
        if let Some((quote, received_ms)) = self.router.latest_quote(symbol) {
            let age = now - received_ms;
            candidates.push(Mark {
                price: Some(quote.mid()),
                timestamp: Some(received_ms),
                source: MarkSource::Quote,
                status: if age <= self.quote_fresh_ms {
                    MarkStatus::Fresh
                } else {
                    MarkStatus::Stale
                },
                age_ms: Some(age),
            });
        }

        // 2. Latest streamed bar close.
        let key = BarKey::new(symbol, timeframe);
        if let Some(bar) = self.router.live_bars().last_closed(&key) {
            let closed_at = bar.ts_event + interval_ms;
            let age = now - closed_at;
            candidates.push(Mark {
                price: Some(bar.close),
                timestamp: Some(closed_at),
                source: MarkSource::Bar,
                status: if age <= bar_fresh_ms {
                    MarkStatus::Fresh
                } else {
                    MarkStatus::Stale
                },
                age_ms: Some(age),
            });
        }

        // 3. Warm-cache tail.
        if let Some(bar) = self.warm.peek(symbol, 1).last() {
            let closed_at = bar.ts_event + 60_000;
            let age = now - closed_at;
            candidates.push(Mark {
                price: Some(bar.close),
                timestamp: Some(closed_at),
                source: MarkSource::Cache,
                status: if age <= bar_fresh_ms {
                    MarkStatus::Fresh
                } else {
                    MarkStatus::Stale
                },
                age_ms: Some(age),
            });
        }

        // First fresh candidate in preference order wins; otherwise the
        // first stale one; otherwise unknown.
        let mark = candidates
            .iter()
            .find(|m| m.status == MarkStatus::Fresh)
            .or_else(|| candidates.first())
            .copied()
            .unwrap_or_else(Mark::unknown);

        if mark.is_fresh() {
            self.last_fresh_ms.store(now, Ordering::SeqCst);
        }
        mark
    }

    // -------------------------------------------------------------------------
    // Verdicts
    // -------------------------------------------------------------------------

    /// Trading is frozen whenever the mark is not FRESH.
    pub fn should_freeze_trading(&self, symbol: &str, timeframe: &str) -> FreezeVerdict {
        let mark = self.get_mark(symbol, timeframe);
        match mark.status {
            MarkStatus::Fresh => FreezeVerdict {
                frozen: false,
                reason: None,
                mark,
            },
            MarkStatus::Stale => FreezeVerdict {
                frozen: true,
                reason: Some(format!(
                    "mark stale ({}ms old from {:?})",
                    mark.age_ms.unwrap_or(-1),
                    mark.source
                )),
                mark,
            },
            MarkStatus::Unknown => FreezeVerdict {
                frozen: true,
                reason: Some("no mark available".to_string()),
                mark,
            },
        }
    }

    /// True when no symbol has produced a fresh mark for longer than the
    /// configured window: autonomous actions (promotions, evolution) stop.
    pub fn should_halt_autonomy(&self) -> bool {
        let last = self.last_fresh_ms.load(Ordering::SeqCst);
        self.clock.now_ms() - last > self.autonomy_halt_ms
    }

    // -------------------------------------------------------------------------
    // P&L
    // -------------------------------------------------------------------------

    /// Unrealized P&L in dollars against a FRESH mark. Returns `None` when
    /// the mark is not fresh: stale P&L is never shown.
    pub fn compute_pnl(
        &self,
        entry_price: f64,
        mark: &Mark,
        side: TradeSide,
        qty: f64,
        point_value: f64,
    ) -> Option<f64> {
        if !mark.is_fresh() {
            return None;
        }
        let price = mark.price?;
        Some((price - entry_price) * side.direction() * qty * point_value)
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    /// Append-only record of a freshness decision that gated an action.
    pub fn persist_freshness_audit(&self, bot_id: &str, symbol: &str, mark: &Mark, context: &str) {
        let detail = serde_json::json!({
            "context": context,
            "status": mark.status,
            "source": mark.source,
            "age_ms": mark.age_ms,
            "price": mark.price,
        });
        if let Err(e) = self.ledger.audit(
            "FRESHNESS_DECISION",
            Some(bot_id),
            Some(symbol),
            Some(&detail),
            self.clock.now_ms(),
        ) {
            warn!(bot_id, symbol, error = %e, "failed to persist freshness audit");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BarCache, ColdStore, RemoteHydrator};
    use crate::clock::manual::ManualClock;
    use crate::clock::Clock;
    use crate::market_data::stream::StreamEvent;
    use crate::market_data::tick_ingestor::{NullTickSink, TickIngestor};
    use crate::market_data::{Bar, QuoteTick};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        authority: Arc<PriceAuthority>,
        router: Arc<LiveDataRouter>,
        warm: Arc<WarmCache>,
        clock: Arc<ManualClock>,
        ledger: Ledger,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 14, 0, 0).unwrap());
        let cold = ColdStore::open_in_memory().unwrap();
        let hydrator = RemoteHydrator::new("http://127.0.0.1:1", None);
        let warm = WarmCache::new(clock.clone(), cold.clone(), hydrator, 10_000, 1_000, 120);
        let cache = BarCache::new(warm.clone(), cold);
        let ingestor = Arc::new(TickIngestor::new(clock.clone(), Box::new(NullTickSink)));
        let router = LiveDataRouter::new(clock.clone(), cache, ingestor, 30);
        let ledger = Ledger::open_in_memory().unwrap();
        let authority = PriceAuthority::new(
            clock.clone(),
            router.clone(),
            warm.clone(),
            ledger.clone(),
            30,
            2,
            300,
        );
        Fixture {
            authority,
            router,
            warm,
            clock,
            ledger,
        }
    }

    fn quote(symbol: &str, bid: f64, ask: f64) -> QuoteTick {
        QuoteTick {
            symbol: symbol.into(),
            ts_ns: 0,
            seq: None,
            bid,
            bid_size: 1,
            ask,
            ask_size: 1,
        }
    }

    fn bar(ts_ms: i64, close: f64) -> Bar {
        Bar {
            ts_event: ts_ms,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1,
        }
    }

    #[test]
    fn quote_wins_when_fresh() {
        let f = fixture();
        f.router
            .handle_stream_event(StreamEvent::Quote(quote("MES", 4999.75, 5000.25)));

        let mark = f.authority.get_mark("MES", "1m");
        assert_eq!(mark.source, MarkSource::Quote);
        assert_eq!(mark.status, MarkStatus::Fresh);
        assert!((mark.price.unwrap() - 5000.0).abs() < 1e-9);
    }

    #[test]
    fn stale_quote_falls_back_to_fresh_bar() {
        let f = fixture();
        f.router
            .handle_stream_event(StreamEvent::Quote(quote("MES", 4999.75, 5000.25)));

        // 65s of silence: quote stale (threshold 30s).
        f.clock.advance(Duration::seconds(65));

        // A just-closed bar arrives.
        let bar_ts = f.clock.now_ms() - 60_000;
        f.router.handle_stream_event(StreamEvent::Bar {
            key: BarKey::one_minute("MES"),
            bar: bar(bar_ts, 5001.0),
            closed: true,
        });

        let mark = f.authority.get_mark("MES", "1m");
        assert_eq!(mark.source, MarkSource::Bar);
        assert_eq!(mark.status, MarkStatus::Fresh);
        assert!((mark.price.unwrap() - 5001.0).abs() < 1e-9);
    }

    #[test]
    fn all_stale_returns_preferred_stale_candidate() {
        let f = fixture();
        f.router
            .handle_stream_event(StreamEvent::Quote(quote("MES", 4999.75, 5000.25)));
        f.clock.advance(Duration::seconds(65));

        let mark = f.authority.get_mark("MES", "1m");
        assert_eq!(mark.source, MarkSource::Quote);
        assert_eq!(mark.status, MarkStatus::Stale);

        let verdict = f.authority.should_freeze_trading("MES", "1m");
        assert!(verdict.frozen);
        assert!(verdict.reason.unwrap().contains("stale"));
    }

    #[test]
    fn cache_tail_serves_when_no_live_data() {
        let f = fixture();
        let now = f.clock.now_ms();
        f.warm.push_live_bar("MES", bar(now - 60_000, 5002.0));

        let mark = f.authority.get_mark("MES", "1m");
        assert_eq!(mark.source, MarkSource::Cache);
        assert_eq!(mark.status, MarkStatus::Fresh);
    }

    #[test]
    fn unknown_when_nothing_available() {
        let f = fixture();
        let mark = f.authority.get_mark("MNQ", "1m");
        assert_eq!(mark.source, MarkSource::None);
        assert_eq!(mark.status, MarkStatus::Unknown);
        assert!(mark.price.is_none());

        let verdict = f.authority.should_freeze_trading("MNQ", "1m");
        assert!(verdict.frozen);
    }

    #[test]
    fn pnl_requires_fresh_mark() {
        let f = fixture();
        f.router
            .handle_stream_event(StreamEvent::Quote(quote("MES", 5009.75, 5010.25)));
        let fresh = f.authority.get_mark("MES", "1m");

        // Long 2 contracts of a $5/point instrument, entry 5000, mark 5010.
        let pnl = f
            .authority
            .compute_pnl(5000.0, &fresh, TradeSide::Buy, 2.0, 5.0)
            .unwrap();
        assert!((pnl - 100.0).abs() < 1e-9);

        // Short side mirrors.
        let pnl = f
            .authority
            .compute_pnl(5000.0, &fresh, TradeSide::Sell, 2.0, 5.0)
            .unwrap();
        assert!((pnl + 100.0).abs() < 1e-9);

        // Stale mark: no P&L at all.
        f.clock.advance(Duration::seconds(65));
        let stale = f.authority.get_mark("MES", "1m");
        assert!(f
            .authority
            .compute_pnl(5000.0, &stale, TradeSide::Buy, 2.0, 5.0)
            .is_none());
    }

    #[test]
    fn autonomy_halts_after_degraded_window() {
        let f = fixture();
        f.router
            .handle_stream_event(StreamEvent::Quote(quote("MES", 4999.75, 5000.25)));
        let _ = f.authority.get_mark("MES", "1m");
        assert!(!f.authority.should_halt_autonomy());

        // 6 minutes with no fresh marks (threshold 300s).
        f.clock.advance(Duration::seconds(360));
        let _ = f.authority.get_mark("MES", "1m");
        assert!(f.authority.should_halt_autonomy());
    }

    #[test]
    fn freshness_audit_is_persisted() {
        let f = fixture();
        let mark = f.authority.get_mark("MES", "1m");
        f.authority
            .persist_freshness_audit("bot-1", "MES", &mark, "entry_gate");
        assert_eq!(f.ledger.audit_count("FRESHNESS_DECISION").unwrap(), 1);
    }
}
