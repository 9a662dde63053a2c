// =============================================================================
// Bar Cache — facade over warm cache, cold store, and remote hydrator
// =============================================================================
//
// The single entry point the rest of the plane uses to read history.
// Hydration priority is warm -> cold -> remote (delegated to the warm
// cache); timeframes above 1m are aggregated in memory from 1m bars with
// the same chunked reduce the cold store uses.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};

use super::cold_store::{ColdStore, StoreSummary};
use super::warm_cache::WarmCache;
use crate::market_data::{aggregate_bars, timeframe_minutes, Bar};

/// Options for a facade read.
#[derive(Debug, Clone, Copy)]
pub struct BarFetchOpts {
    /// Maximum bars returned (newest kept).
    pub limit: usize,
}

impl Default for BarFetchOpts {
    fn default() -> Self {
        Self { limit: 500 }
    }
}

/// Facade over the three cache tiers.
#[derive(Clone)]
pub struct BarCache {
    warm: Arc<WarmCache>,
    cold: ColdStore,
}

impl BarCache {
    pub fn new(warm: Arc<WarmCache>, cold: ColdStore) -> Self {
        Self { warm, cold }
    }

    pub fn warm(&self) -> &Arc<WarmCache> {
        &self.warm
    }

    /// 1m bars for `symbol`, hydrating through the tiers as needed.
    pub async fn get_bars(&self, symbol: &str, opts: BarFetchOpts) -> Vec<Bar> {
        self.warm.get(symbol, opts.limit).await
    }

    /// Bars for an arbitrary timeframe. 1m is served directly; anything
    /// larger is aggregated in memory from 1m bars.
    pub async fn get_bars_with_timeframe(
        &self,
        symbol: &str,
        timeframe: &str,
        opts: BarFetchOpts,
    ) -> Result<Vec<Bar>> {
        let minutes = timeframe_minutes(timeframe)
            .with_context(|| format!("unknown timeframe {timeframe}"))?;

        if minutes == 1 {
            return Ok(self.get_bars(symbol, opts).await);
        }

        // Pull enough 1m bars to fill `limit` aggregated bars.
        let base_limit = opts.limit.saturating_mul(minutes as usize);
        let base = self.warm.get(symbol, base_limit).await;
        let mut aggregated = aggregate_bars(&base, 60_000, minutes as usize);

        if aggregated.len() > opts.limit {
            let excess = aggregated.len() - opts.limit;
            aggregated.drain(..excess);
        }
        Ok(aggregated)
    }

    /// Cold-store summary for the control surface.
    pub fn summary(&self) -> Result<StoreSummary> {
        self.cold.summary()
    }
}
