// =============================================================================
// Strategy archetypes — closed set of entry conditions
// =============================================================================
//
// Every bot resolves to exactly one archetype.  The set is closed and the
// match exhaustive: an unknown archetype string is a startup fail-closed
// (the runner refuses to start), never a runtime fallback.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::thresholds::BotThresholds;
use crate::types::TradeSide;

/// Named strategy patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Archetype {
    MeanReversion,
    TrendContinuation,
    VwapTouch,
    MomentumSurge,
    Breakout,
}

impl Archetype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeanReversion => "MEAN_REVERSION",
            Self::TrendContinuation => "TREND_CONTINUATION",
            Self::VwapTouch => "VWAP_TOUCH",
            Self::MomentumSurge => "MOMENTUM_SURGE",
            Self::Breakout => "BREAKOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MEAN_REVERSION" => Some(Self::MeanReversion),
            "TREND_CONTINUATION" => Some(Self::TrendContinuation),
            "VWAP_TOUCH" => Some(Self::VwapTouch),
            "MOMENTUM_SURGE" => Some(Self::MomentumSurge),
            "BREAKOUT" => Some(Self::Breakout),
            _ => None,
        }
    }
}

impl std::fmt::Display for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicator snapshot an entry evaluation needs. All values are for the
/// just-closed bar; the session range excludes it.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext {
    pub close: f64,
    pub rsi: f64,
    pub vwap: f64,
    pub atr: f64,
    pub ema9: f64,
    pub ema21: f64,
    pub momentum: f64,
    pub high_of_session: f64,
    pub low_of_session: f64,
}

/// Evaluate the archetype's entry condition. `None` means no signal.
pub fn entry_signal(
    archetype: Archetype,
    ctx: &EntryContext,
    thresholds: &BotThresholds,
) -> Option<TradeSide> {
    if ctx.atr <= 0.0 {
        return None;
    }
    let vwap_dev = (ctx.close - ctx.vwap).abs() / ctx.atr;

    match archetype {
        Archetype::MeanReversion => {
            if ctx.rsi < thresholds.rsi_oversold
                && vwap_dev > thresholds.deviation
                && ctx.close < ctx.vwap
            {
                Some(TradeSide::Buy)
            } else if ctx.rsi > thresholds.rsi_overbought
                && vwap_dev > thresholds.deviation
                && ctx.close > ctx.vwap
            {
                Some(TradeSide::Sell)
            } else {
                None
            }
        }
        Archetype::TrendContinuation => {
            let bar = ctx.atr * thresholds.momentum_mult * 0.1;
            if ctx.ema9 > ctx.ema21 && ctx.momentum > bar {
                Some(TradeSide::Buy)
            } else if ctx.ema9 < ctx.ema21 && ctx.momentum < -bar {
                Some(TradeSide::Sell)
            } else {
                None
            }
        }
        Archetype::VwapTouch => {
            if vwap_dev < thresholds.vwap_distance {
                if ctx.close > ctx.vwap {
                    Some(TradeSide::Buy)
                } else if ctx.close < ctx.vwap {
                    Some(TradeSide::Sell)
                } else {
                    None
                }
            } else {
                None
            }
        }
        Archetype::MomentumSurge => {
            let bar = ctx.atr * thresholds.momentum_mult;
            if ctx.momentum > bar {
                Some(TradeSide::Buy)
            } else if ctx.momentum < -bar {
                Some(TradeSide::Sell)
            } else {
                None
            }
        }
        Archetype::Breakout => {
            let bar = ctx.atr * thresholds.momentum_mult * 0.5;
            if ctx.close > ctx.high_of_session && ctx.momentum > bar {
                Some(TradeSide::Buy)
            } else if ctx.close < ctx.low_of_session && ctx.momentum < -bar {
                Some(TradeSide::Sell)
            } else {
                None
            }
        }
    }
}
