// =============================================================================
// Live Data Router — streaming feed with cached fallback
// =============================================================================
//
// Routes bars and quotes from the streaming feed to subscribers, falling
// back to polling the bar cache when the stream degrades.
//
// Source state machine:
//
//   Streaming ──(disconnect / subscription failed / stale ticks)──▶ CachePolling
//   CachePolling ──(first live bar or quote)──▶ Streaming   (self-heal)
//   CachePolling ──(repeated empty polls)──▶ Offline
//
// Every transition away from Streaming emits `DataFrozen`; every transition
// back emits `DataResumed`.  Runners treat these as edge triggers.
//
// Ordering: bars are delivered per key in timestamp order; a bar at or
// before the last delivered timestamp is dropped.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::tick_ingestor::TickIngestor;
use super::{Bar, BarBuffer, BarKey, QuoteTick};
use crate::cache::{BarCache, BarFetchOpts};
use crate::clock::SharedClock;
use crate::market_data::stream::StreamEvent;

/// Consecutive empty poll cycles before the router declares itself offline.
const OFFLINE_AFTER_EMPTY_POLLS: u32 = 3;

/// Where market data is currently coming from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Streaming,
    CachePolling,
    Offline,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Streaming => "streaming",
            Self::CachePolling => "cache_polling",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Edge-triggered events delivered to paper runners.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    DataFrozen { reason: String },
    DataResumed,
}

/// Fuses the streaming feed with cached fallback and fans bars/quotes out
/// to subscribers.
pub struct LiveDataRouter {
    clock: SharedClock,
    bar_cache: BarCache,
    live_bars: Arc<BarBuffer>,
    ingestor: Arc<TickIngestor>,

    bar_subs: RwLock<HashMap<BarKey, Vec<UnboundedSender<Bar>>>>,
    quote_subs: RwLock<HashMap<String, Vec<UnboundedSender<QuoteTick>>>>,
    last_delivered: RwLock<HashMap<BarKey, i64>>,
    last_quotes: RwLock<HashMap<String, (QuoteTick, i64)>>,

    state: RwLock<DataSource>,
    last_live_event_ms: AtomicI64,
    empty_polls: AtomicU32,
    stale_tick_secs: u64,

    events_tx: broadcast::Sender<RouterEvent>,
}

impl LiveDataRouter {
    pub fn new(
        clock: SharedClock,
        bar_cache: BarCache,
        ingestor: Arc<TickIngestor>,
        stale_tick_secs: u64,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            clock,
            bar_cache,
            live_bars: Arc::new(BarBuffer::new(500)),
            ingestor,
            bar_subs: RwLock::new(HashMap::new()),
            quote_subs: RwLock::new(HashMap::new()),
            last_delivered: RwLock::new(HashMap::new()),
            last_quotes: RwLock::new(HashMap::new()),
            state: RwLock::new(DataSource::CachePolling),
            last_live_event_ms: AtomicI64::new(0),
            empty_polls: AtomicU32::new(0),
            stale_tick_secs,
            events_tx,
        })
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe to closed bars for `key` (`symbol:timeframe`).
    pub fn subscribe_bars(&self, key: BarKey) -> UnboundedReceiver<Bar> {
        let (tx, rx) = unbounded_channel();
        self.bar_subs.write().entry(key).or_default().push(tx);
        rx
    }

    /// Subscribe to quote ticks for `symbol`.
    pub fn subscribe_quotes(&self, symbol: &str) -> UnboundedReceiver<QuoteTick> {
        let (tx, rx) = unbounded_channel();
        self.quote_subs
            .write()
            .entry(symbol.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to frozen/resumed edge events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Stream event handling
    // -------------------------------------------------------------------------

    pub fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Connected => {
                self.transition(DataSource::Streaming, "stream connected");
            }
            StreamEvent::Bar { key, bar, closed } => {
                self.mark_live_event();
                self.live_bars.update(key.clone(), bar, closed);
                if closed {
                    if key.timeframe == "1m" {
                        self.bar_cache.warm().push_live_bar(&key.symbol, bar);
                    }
                    self.deliver_bar(&key, bar);
                }
            }
            StreamEvent::Quote(quote) => {
                self.mark_live_event();
                let now_ms = self.clock.now_ms();
                self.ingestor.ingest_quote(quote.clone());
                self.last_quotes
                    .write()
                    .insert(quote.symbol.clone(), (quote.clone(), now_ms));
                self.deliver_quote(quote);
            }
            StreamEvent::Trade(trade) => {
                self.mark_live_event();
                self.ingestor.ingest_trade(trade);
            }
            StreamEvent::SubscriptionFailed { symbol, reason } => {
                warn!(symbol = %symbol, reason = %reason, "stream subscription failed");
                self.transition(DataSource::CachePolling, "subscription failed");
            }
            StreamEvent::Disconnected => {
                self.transition(DataSource::CachePolling, "stream disconnected");
            }
        }
    }

    /// A live bar/quote/trade arrived: record it and self-heal out of the
    /// fallback states.
    fn mark_live_event(&self) {
        self.last_live_event_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
        self.empty_polls.store(0, Ordering::SeqCst);
        if *self.state.read() != DataSource::Streaming {
            self.transition(DataSource::Streaming, "live data resumed");
        }
    }

    /// Called by a supervisor tick: detect a silent stream and fall back.
    pub fn check_staleness(&self) {
        if *self.state.read() != DataSource::Streaming {
            return;
        }
        let last = self.last_live_event_ms.load(Ordering::SeqCst);
        if last == 0 {
            return;
        }
        let age_ms = self.clock.now_ms() - last;
        if age_ms > (self.stale_tick_secs as i64) * 1_000 {
            warn!(age_ms, "no live ticks within threshold -- falling back to cache");
            self.transition(DataSource::CachePolling, "stale data");
        }
    }

    fn transition(&self, to: DataSource, reason: &str) {
        let mut state = self.state.write();
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        drop(state);

        info!(from = %from, to = %to, reason, "data source transition");

        match (from, to) {
            (DataSource::Streaming, _) => {
                let _ = self.events_tx.send(RouterEvent::DataFrozen {
                    reason: reason.to_string(),
                });
            }
            (_, DataSource::Streaming) => {
                let _ = self.events_tx.send(RouterEvent::DataResumed);
            }
            (DataSource::CachePolling, DataSource::Offline) => {
                error!("market data offline -- cache polling found no data");
                let _ = self.events_tx.send(RouterEvent::DataFrozen {
                    reason: "offline".to_string(),
                });
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Cache polling fallback
    // -------------------------------------------------------------------------

    /// One polling pass over `symbols`. No-op while streaming. Returns the
    /// number of bars delivered.
    pub async fn poll_cycle(&self, symbols: &[String]) -> usize {
        if *self.state.read() == DataSource::Streaming {
            return 0;
        }

        let mut delivered = 0;
        for symbol in symbols {
            let bars = self
                .bar_cache
                .get_bars(symbol, BarFetchOpts { limit: 2 })
                .await;
            let key = BarKey::one_minute(symbol.clone());
            for bar in bars {
                if self.deliver_bar(&key, bar) {
                    delivered += 1;
                }
            }
        }

        if delivered == 0 {
            let empties = self.empty_polls.fetch_add(1, Ordering::SeqCst) + 1;
            if empties >= OFFLINE_AFTER_EMPTY_POLLS && *self.state.read() == DataSource::CachePolling
            {
                self.transition(DataSource::Offline, "repeated empty polls");
            }
        } else {
            self.empty_polls.store(0, Ordering::SeqCst);
            if *self.state.read() == DataSource::Offline {
                self.transition(DataSource::CachePolling, "cache data available");
            }
        }
        delivered
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    /// Deliver a closed bar to subscribers unless it is at or before the
    /// last delivered timestamp for its key. Returns whether it was sent.
    fn deliver_bar(&self, key: &BarKey, bar: Bar) -> bool {
        {
            let mut last = self.last_delivered.write();
            let entry = last.entry(key.clone()).or_insert(i64::MIN);
            if bar.ts_event <= *entry {
                debug!(key = %key, ts = bar.ts_event, "dropping out-of-order bar");
                return false;
            }
            *entry = bar.ts_event;
        }

        let mut subs = self.bar_subs.write();
        if let Some(senders) = subs.get_mut(key) {
            senders.retain(|tx| tx.send(bar).is_ok());
        }
        true
    }

    fn deliver_quote(&self, quote: QuoteTick) {
        let mut subs = self.quote_subs.write();
        if let Some(senders) = subs.get_mut(&quote.symbol) {
            senders.retain(|tx| tx.send(quote.clone()).is_ok());
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn source_state(&self) -> DataSource {
        *self.state.read()
    }

    /// Latest quote for `symbol` with its local receive time.
    pub fn latest_quote(&self, symbol: &str) -> Option<(QuoteTick, i64)> {
        self.last_quotes.read().get(symbol).cloned()
    }

    /// Live bar buffer (latest streamed bars per key).
    pub fn live_bars(&self) -> &Arc<BarBuffer> {
        &self.live_bars
    }

    /// Milliseconds since the last live event, if any was ever seen.
    pub fn live_event_age_ms(&self) -> Option<i64> {
        let last = self.last_live_event_ms.load(Ordering::SeqCst);
        (last > 0).then(|| self.clock.now_ms() - last)
    }
}
