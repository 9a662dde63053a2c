// =============================================================================
// Warm Cache — bounded in-memory bars per symbol
// =============================================================================
//
// The middle tier of the bar cache.  Each symbol owns an exclusive mutable
// copy of its recent 1m bars, hard-capped at `max_bars`.  Hydration runs
// warm -> cold -> remote, with a per-symbol refresh lock so at most one
// hydration is in flight per symbol; concurrent callers await the holder
// and then observe its result instead of hydrating again.
//
// Memory-cap invariant: after any successful public operation,
// `bars.len() <= max_bars` for every symbol.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::cold_store::ColdStore;
use super::hydrator::RemoteHydrator;
use crate::clock::SharedClock;
use crate::market_data::Bar;

const MS_PER_DAY: i64 = 86_400_000;
/// Cold-store bars newer than this are served without hitting the remote.
const COLD_FRESH_MS: i64 = 24 * 3_600_000;
/// Days of history pulled when a symbol is empty.
const DEFAULT_REFRESH_DAYS: i64 = 5;

#[derive(Default)]
struct SymbolSlot {
    bars: Vec<Bar>,
    last_refresh_ms: Option<i64>,
    last_error: Option<String>,
}

/// Result of a pre-warm sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreWarmReport {
    pub from_cold: usize,
    pub hydrated_stale: usize,
    pub from_remote: usize,
    pub missing: Vec<String>,
}

/// Bounded in-memory bar cache with per-symbol refresh locks.
pub struct WarmCache {
    clock: SharedClock,
    max_bars: usize,
    emergency_floor: usize,
    stale_secs: u64,
    slots: RwLock<HashMap<String, SymbolSlot>>,
    refresh_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cold: ColdStore,
    hydrator: RemoteHydrator,
}

impl WarmCache {
    pub fn new(
        clock: SharedClock,
        cold: ColdStore,
        hydrator: RemoteHydrator,
        max_bars: usize,
        emergency_floor: usize,
        stale_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            max_bars,
            emergency_floor,
            stale_secs,
            slots: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            cold,
            hydrator,
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Cached bars for `symbol` (newest `limit`, oldest first) without
    /// triggering hydration.
    pub fn peek(&self, symbol: &str, limit: usize) -> Vec<Bar> {
        let slots = self.slots.read();
        match slots.get(symbol) {
            Some(slot) => {
                let start = slot.bars.len().saturating_sub(limit);
                slot.bars[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Timestamp of the newest cached bar for `symbol`.
    pub fn newest_ts(&self, symbol: &str) -> Option<i64> {
        let slots = self.slots.read();
        slots
            .get(symbol)
            .and_then(|slot| slot.bars.last())
            .map(|b| b.ts_event)
    }

    /// Cached bars, hydrating when the cache is empty and kicking a
    /// background refresh when it is stale.
    pub async fn get(self: &Arc<Self>, symbol: &str, limit: usize) -> Vec<Bar> {
        let (is_empty, is_stale) = {
            let slots = self.slots.read();
            match slots.get(symbol) {
                Some(slot) if !slot.bars.is_empty() => {
                    let newest = slot.bars.last().map(|b| b.ts_event).unwrap_or(0);
                    let age_ms = self.clock.now_ms() - newest;
                    (false, age_ms > (self.stale_secs as i64) * 1_000)
                }
                _ => (true, false),
            }
        };

        if is_empty {
            if let Err(e) = self.refresh(symbol, DEFAULT_REFRESH_DAYS).await {
                warn!(symbol, error = %e, "warm cache hydration failed");
            }
        } else if is_stale {
            let cache = Arc::clone(self);
            let symbol = symbol.to_string();
            tokio::spawn(async move {
                if let Err(e) = cache.refresh(&symbol, 1).await {
                    warn!(symbol = %symbol, error = %e, "background refresh failed");
                }
            });
        }

        self.peek(symbol, limit)
    }

    // -------------------------------------------------------------------------
    // Hydration
    // -------------------------------------------------------------------------

    /// Refresh `symbol` with up to `days` of history, warm -> cold -> remote.
    ///
    /// At most one hydration runs per symbol; a second caller awaits the
    /// first and returns once its result is visible.
    pub async fn refresh(self: &Arc<Self>, symbol: &str, days: i64) -> Result<()> {
        let lock = {
            let mut locks = self.refresh_locks.lock();
            Arc::clone(
                locks
                    .entry(symbol.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let _guard = lock.lock().await;

        // A refresh that completed while we waited for the lock counts as
        // ours.
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(symbol) {
                if let Some(at) = slot.last_refresh_ms {
                    if self.clock.now_ms() - at < (self.stale_secs as i64) * 1_000 {
                        return Ok(());
                    }
                }
            }
        }

        match self.do_refresh(symbol, days).await {
            Ok(source) => {
                let mut slots = self.slots.write();
                let slot = slots.entry(symbol.to_string()).or_default();
                slot.last_refresh_ms = Some(self.clock.now_ms());
                slot.last_error = None;
                debug!(symbol, source, bars = slot.bars.len(), "warm cache refreshed");
                Ok(())
            }
            Err(e) => {
                let mut slots = self.slots.write();
                let slot = slots.entry(symbol.to_string()).or_default();
                slot.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// The hydration body. Returns the tier that satisfied the refresh.
    async fn do_refresh(self: &Arc<Self>, symbol: &str, days: i64) -> Result<&'static str> {
        let now_ms = self.clock.now_ms();
        let start_ms = now_ms - days.max(1) * MS_PER_DAY;

        // Warm: nothing to do when the cached tail is already fresh.
        if let Some(newest) = self.newest_ts(symbol) {
            if now_ms - newest <= (self.stale_secs as i64) * 1_000 {
                return Ok("warm");
            }
        }

        // Cold store.
        let cold_bars = self
            .cold
            .get(symbol, "1m", Some(start_ms), None, None)
            .context("cold store read failed")?;
        let cold_fresh = cold_bars
            .last()
            .map(|b| now_ms - b.ts_event <= COLD_FRESH_MS)
            .unwrap_or(false);

        if cold_fresh {
            self.merge_bars(symbol, &cold_bars);
            return Ok("cold");
        }

        // Remote, falling back to whatever the cold store had.
        match self
            .hydrator
            .fetch_with_retry(symbol, start_ms, now_ms, "1m")
            .await
        {
            Ok(remote_bars) => {
                if let Err(e) = self.cold.store(symbol, "1m", &remote_bars, now_ms) {
                    warn!(symbol, error = %e, "failed to persist hydrated bars to cold store");
                }
                self.merge_bars(symbol, &cold_bars);
                self.merge_bars(symbol, &remote_bars);
                Ok("remote")
            }
            Err(e) => {
                if cold_bars.is_empty() {
                    Err(anyhow::anyhow!(e).context("remote hydration failed with empty cold store"))
                } else {
                    // Stale cold data beats no data.
                    warn!(symbol, error = %e, "remote hydration failed -- serving stale cold bars");
                    self.merge_bars(symbol, &cold_bars);
                    Ok("cold-stale")
                }
            }
        }
    }

    /// Feed a live closed bar into the cache. Called by the data router so
    /// reads stay current between hydrations.
    pub fn push_live_bar(&self, symbol: &str, bar: Bar) {
        self.merge_bars(symbol, std::slice::from_ref(&bar));
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(symbol) {
            slot.last_refresh_ms = Some(self.clock.now_ms());
        }
    }

    fn merge_bars(&self, symbol: &str, incoming: &[Bar]) {
        if incoming.is_empty() {
            return;
        }
        let mut slots = self.slots.write();
        let slot = slots.entry(symbol.to_string()).or_default();

        slot.bars.extend_from_slice(incoming);
        slot.bars.sort_by_key(|b| b.ts_event);
        slot.bars.dedup_by_key(|b| b.ts_event);

        // Keep the newest bars within the hard cap.
        if slot.bars.len() > self.max_bars {
            let excess = slot.bars.len() - self.max_bars;
            slot.bars.drain(..excess);
        }
    }

    // -------------------------------------------------------------------------
    // Pre-warm
    // -------------------------------------------------------------------------

    /// Warm all `symbols` at startup: cold-store bars fresh within 24h are
    /// used as-is; stale cold data is served immediately with a remote
    /// refresh queued behind it; symbols with no cold data go straight to
    /// the remote.
    pub async fn pre_warm(self: &Arc<Self>, symbols: &[String]) -> PreWarmReport {
        let mut report = PreWarmReport::default();
        let now_ms = self.clock.now_ms();
        let start_ms = now_ms - DEFAULT_REFRESH_DAYS * MS_PER_DAY;

        let mut still_missing: Vec<String> = Vec::new();

        for symbol in symbols {
            let cold_bars = match self.cold.get(symbol, "1m", Some(start_ms), None, None) {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "pre-warm cold read failed");
                    still_missing.push(symbol.clone());
                    continue;
                }
            };

            if cold_bars.is_empty() {
                still_missing.push(symbol.clone());
                continue;
            }

            let fresh = cold_bars
                .last()
                .map(|b| now_ms - b.ts_event <= COLD_FRESH_MS)
                .unwrap_or(false);

            self.merge_bars(symbol, &cold_bars);

            if fresh {
                let mut slots = self.slots.write();
                if let Some(slot) = slots.get_mut(symbol) {
                    slot.last_refresh_ms = Some(now_ms);
                }
                report.from_cold += 1;
            } else {
                report.hydrated_stale += 1;
                // Queue a remote refresh behind the stale data.
                let cache = Arc::clone(self);
                let symbol = symbol.clone();
                tokio::spawn(async move {
                    if let Err(e) = cache.refresh(&symbol, 1).await {
                        warn!(symbol = %symbol, error = %e, "queued pre-warm refresh failed");
                    }
                });
            }
        }

        // Remote pass for symbols with no cold data at all.
        for symbol in still_missing {
            match self.refresh(&symbol, DEFAULT_REFRESH_DAYS).await {
                Ok(()) if !self.peek(&symbol, 1).is_empty() => report.from_remote += 1,
                _ => report.missing.push(symbol),
            }
        }

        info!(
            from_cold = report.from_cold,
            hydrated_stale = report.hydrated_stale,
            from_remote = report.from_remote,
            missing = report.missing.len(),
            "pre-warm complete"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Memory pressure
    // -------------------------------------------------------------------------

    /// Reduce every symbol to the emergency floor, newest bars preserved.
    /// Idempotent. Returns evicted counts per symbol.
    pub fn trim_for_memory_pressure(&self) -> HashMap<String, usize> {
        let mut evicted = HashMap::new();
        let mut slots = self.slots.write();

        for (symbol, slot) in slots.iter_mut() {
            if slot.bars.len() > self.emergency_floor {
                let excess = slot.bars.len() - self.emergency_floor;
                slot.bars.drain(..excess);
                evicted.insert(symbol.clone(), excess);
            }
        }

        if !evicted.is_empty() {
            warn!(symbols = evicted.len(), "emergency trim applied");
        }
        evicted
    }

    /// Total bars held across all symbols.
    pub fn total_bars(&self) -> usize {
        self.slots.read().values().map(|s| s.bars.len()).sum()
    }

    /// Last refresh error for a symbol, if the most recent attempt failed.
    pub fn last_error(&self, symbol: &str) -> Option<String> {
        self.slots
            .read()
            .get(symbol)
            .and_then(|s| s.last_error.clone())
    }
}
