// =============================================================================
// Bot thresholds — deterministic per-bot strategy variation
// =============================================================================
//
// Two bots with identical strategy configs must still produce
// distinguishable signals, or a fleet collapses into one correlated
// position.  Each bot's thresholds are derived from SHA-256 of its id:
// pure, reproducible anywhere (runner, backtest harness, tests), and
// clamped to sane bounds.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Per-bot entry-condition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BotThresholds {
    /// RSI below this is oversold. Bounds [25, 35].
    pub rsi_oversold: f64,
    /// RSI above this is overbought. Bounds [65, 75].
    pub rsi_overbought: f64,
    /// Minimum |close - VWAP| / ATR for mean reversion. Bounds [1.0, 2.0].
    pub deviation: f64,
    /// Momentum multiplier applied to ATR. Bounds [0.8, 1.2].
    pub momentum_mult: f64,
    /// Maximum |close - VWAP| / ATR for a VWAP touch. Bounds [0.2, 0.5].
    pub vwap_distance: f64,
}

/// Map one digest byte onto [lo, hi].
fn spread(byte: u8, lo: f64, hi: f64) -> f64 {
    lo + (byte as f64 / 255.0) * (hi - lo)
}

/// Pure derivation: `(bot id) -> thresholds`. The same id always yields
/// the same thresholds.
pub fn derive_thresholds(bot_id: &str) -> BotThresholds {
    let digest = Sha256::digest(bot_id.as_bytes());

    BotThresholds {
        rsi_oversold: spread(digest[0], 25.0, 35.0),
        rsi_overbought: spread(digest[1], 65.0, 75.0),
        deviation: spread(digest[2], 1.0, 2.0),
        momentum_mult: spread(digest[3], 0.8, 1.2),
        vwap_distance: spread(digest[4], 0.2, 0.5),
    }
}

/// Thread-safe per-bot threshold cache.
#[derive(Default)]
pub struct ThresholdCache {
    cache: RwLock<HashMap<String, BotThresholds>>,
}

impl ThresholdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_bot(&self, bot_id: &str) -> BotThresholds {
        if let Some(t) = self.cache.read().get(bot_id) {
            return *t;
        }
        let derived = derive_thresholds(bot_id);
        self.cache.write().insert(bot_id.to_string(), derived);
        derived
    }
}
