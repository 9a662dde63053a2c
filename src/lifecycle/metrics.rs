// =============================================================================
// Metrics Aggregator — recompute bot performance from the ledger
// =============================================================================
//
// Everything here derives strictly from paper-trade rows scoped to the
// bot's active account attempt, excluding ORPHAN_RECONCILE closures.  The
// drawdown curve is seeded at a fixed notional so drawdown percentages
// compare across stages and account sizes.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;
use crate::ledger::trades::PaperTradeRecord;
use crate::ledger::Ledger;
use crate::types::{ExitReason, TradeStatus};

/// Equity curve seed for stage-comparable drawdown percentages.
const DRAWDOWN_NOTIONAL: f64 = 10_000.0;
/// Trades required before a Sharpe is reported.
const MIN_TRADES_FOR_SHARPE: usize = 5;
/// Sharpe values are clamped to +/- this.
const SHARPE_CLAMP: f64 = 5.0;
/// Profit factor reported when there are no losing trades.
const PROFIT_FACTOR_CAP: f64 = 999.0;
/// Annualization factor treating per-trade returns as daily.
const ANNUALIZATION: f64 = 252.0;

/// Recomputed performance for one bot within one account attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotMetrics {
    pub closed_trades: i64,
    pub open_trades: i64,
    pub realized_pnl: f64,
    /// Win rate in percent [0, 100].
    pub win_rate_pct: f64,
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
}

/// Recomputes metrics from the trade ledger.
#[derive(Clone)]
pub struct MetricsAggregator {
    ledger: Ledger,
    clock: SharedClock,
}

impl MetricsAggregator {
    pub fn new(ledger: Ledger, clock: SharedClock) -> Self {
        Self { ledger, clock }
    }

    /// Recompute metrics for `bot_id` scoped to `attempt_id`.
    pub fn recompute(&self, bot_id: &str, attempt_id: &str) -> Result<BotMetrics> {
        let trades = self
            .ledger
            .trades_for_bot_attempt(bot_id, attempt_id)
            .context("failed to load trades for metrics")?;
        Ok(compute_metrics(&trades))
    }

    /// Recompute and persist to the bot's cached-metrics column, so the
    /// cache and the ledger can never drift by more than one recompute.
    pub fn recompute_and_cache(&self, bot_id: &str, attempt_id: &str) -> Result<BotMetrics> {
        let metrics = self.recompute(bot_id, attempt_id)?;
        let json = serde_json::to_value(&metrics).context("failed to serialise metrics")?;
        self.ledger
            .set_cached_metrics(bot_id, &json, self.clock.now_ms())?;
        debug!(bot_id, closed = metrics.closed_trades, "metrics cached");
        Ok(metrics)
    }
}

/// Pure fold over a bot's trades (already in deterministic recovery order:
/// exit_ts ASC NULLS LAST, id ASC).
pub fn compute_metrics(trades: &[PaperTradeRecord]) -> BotMetrics {
    let open_trades = trades
        .iter()
        .filter(|t| t.status == TradeStatus::Open)
        .count() as i64;

    let closed: Vec<&PaperTradeRecord> = trades
        .iter()
        .filter(|t| {
            t.status == TradeStatus::Closed && t.exit_reason != Some(ExitReason::OrphanReconcile)
        })
        .collect();

    if closed.is_empty() {
        return BotMetrics {
            open_trades,
            ..BotMetrics::default()
        };
    }

    let closed_count = closed.len();
    let net: Vec<f64> = closed.iter().map(|t| t.pnl - t.fees).collect();
    let realized_pnl: f64 = net.iter().sum();

    let wins = net.iter().filter(|p| **p > 0.0).count();
    let win_rate_pct = (wins as f64 / closed_count as f64) * 100.0;

    // Peak-to-trough on the cumulative equity curve, seeded at a fixed
    // notional.
    let mut equity = DRAWDOWN_NOTIONAL;
    let mut peak = DRAWDOWN_NOTIONAL;
    let mut max_dd_pct: f64 = 0.0;
    for pnl in &net {
        equity += pnl;
        if equity > peak {
            peak = equity;
        } else if peak > 0.0 {
            let dd = (peak - equity) / peak * 100.0;
            max_dd_pct = max_dd_pct.max(dd);
        }
    }

    let gross_profit: f64 = net.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = net.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        (gross_profit / gross_loss).min(PROFIT_FACTOR_CAP)
    } else if gross_profit > 0.0 {
        PROFIT_FACTOR_CAP
    } else {
        0.0
    };

    // Sharpe over per-trade returns against the fixed notional, annualized
    // as if daily, clamped.
    let sharpe = if closed_count >= MIN_TRADES_FOR_SHARPE {
        let returns: Vec<f64> = net.iter().map(|p| p / DRAWDOWN_NOTIONAL).collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();
        if stddev > 0.0 {
            ((mean / stddev) * ANNUALIZATION.sqrt()).clamp(-SHARPE_CLAMP, SHARPE_CLAMP)
        } else {
            0.0
        }
    } else {
        0.0
    };

    BotMetrics {
        closed_trades: closed_count as i64,
        open_trades,
        realized_pnl,
        win_rate_pct,
        max_drawdown_pct: max_dd_pct,
        profit_factor,
        sharpe,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::types::TradeSide;
    use chrono::{TimeZone, Utc};

    fn closed_trade(id: &str, pnl: f64, fees: f64, exit_ts: i64) -> PaperTradeRecord {
        PaperTradeRecord {
            id: id.to_string(),
            bot_id: "bot-1".to_string(),
            account_attempt_id: "att-1".to_string(),
            symbol: "MES".to_string(),
            side: TradeSide::Buy,
            qty: 1.0,
            entry_price: 5000.0,
            entry_ts: exit_ts - 60_000,
            entry_bar_ts: exit_ts - 60_000,
            exit_price: Some(5000.0 + pnl),
            exit_ts: Some(exit_ts),
            status: TradeStatus::Closed,
            exit_reason: Some(ExitReason::Target),
            pnl,
            fees,
            slippage: 0.0,
        }
    }

    fn orphan(id: &str) -> PaperTradeRecord {
        let mut t = closed_trade(id, 0.0, 0.0, 1_000);
        t.exit_reason = Some(ExitReason::OrphanReconcile);
        t
    }

    fn open_trade(id: &str) -> PaperTradeRecord {
        let mut t = closed_trade(id, 0.0, 0.0, 1_000);
        t.status = TradeStatus::Open;
        t.exit_price = None;
        t.exit_ts = None;
        t.exit_reason = None;
        t
    }

    #[test]
    fn empty_ledger_yields_defaults() {
        let m = compute_metrics(&[]);
        assert_eq!(m.closed_trades, 0);
        assert_eq!(m.profit_factor, 0.0);
    }

    #[test]
    fn win_rate_and_profit_factor() {
        let trades = vec![
            closed_trade("t1", 100.0, 0.0, 1_000),
            closed_trade("t2", -50.0, 0.0, 2_000),
            closed_trade("t3", 100.0, 0.0, 3_000),
            closed_trade("t4", -50.0, 0.0, 4_000),
        ];
        let m = compute_metrics(&trades);
        assert_eq!(m.closed_trades, 4);
        assert!((m.win_rate_pct - 50.0).abs() < 1e-9);
        assert!((m.profit_factor - 2.0).abs() < 1e-9);
        assert!((m.realized_pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fees_reduce_net_pnl() {
        let trades = vec![closed_trade("t1", 10.0, 4.0, 1_000)];
        let m = compute_metrics(&trades);
        assert!((m.realized_pnl - 6.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_capped_without_losses() {
        let trades = vec![
            closed_trade("t1", 100.0, 0.0, 1_000),
            closed_trade("t2", 50.0, 0.0, 2_000),
        ];
        let m = compute_metrics(&trades);
        assert_eq!(m.profit_factor, PROFIT_FACTOR_CAP);
    }

    #[test]
    fn orphans_and_open_trades_excluded() {
        let trades = vec![
            closed_trade("t1", 100.0, 0.0, 1_000),
            orphan("t2"),
            open_trade("t3"),
        ];
        let m = compute_metrics(&trades);
        assert_eq!(m.closed_trades, 1);
        assert_eq!(m.open_trades, 1);
        assert!((m.realized_pnl - 100.0).abs() < 1e-9);
        // A single winner with the orphan excluded: 100% win rate.
        assert!((m.win_rate_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_peak_to_trough() {
        // Equity: 10000 -> 10500 -> 9975 (down 5% from peak) -> 10475.
        let trades = vec![
            closed_trade("t1", 500.0, 0.0, 1_000),
            closed_trade("t2", -525.0, 0.0, 2_000),
            closed_trade("t3", 500.0, 0.0, 3_000),
        ];
        let m = compute_metrics(&trades);
        assert!((m.max_drawdown_pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_needs_five_trades_and_clamps() {
        let few: Vec<PaperTradeRecord> = (0..4)
            .map(|i| closed_trade(&format!("t{i}"), 10.0, 0.0, 1_000 + i as i64))
            .collect();
        assert_eq!(compute_metrics(&few).sharpe, 0.0);

        // Five nearly-identical winners: tiny stddev drives Sharpe into the
        // clamp.
        let mut many: Vec<PaperTradeRecord> = (0..5)
            .map(|i| closed_trade(&format!("t{i}"), 10.0, 0.0, 1_000 + i as i64))
            .collect();
        many[4].pnl = 10.01;
        let m = compute_metrics(&many);
        assert_eq!(m.sharpe, SHARPE_CLAMP);
    }

    #[test]
    fn cached_metrics_match_recompute() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap());
        let ledger = Ledger::open_in_memory().unwrap();
        let agg = MetricsAggregator::new(ledger.clone(), clock);

        ledger.upsert_bot(&crate::ledger::BotRecord {
            id: "bot-1".to_string(),
            symbol: "MES".to_string(),
            stage: crate::types::BotStage::Trials,
            archetype: "MEAN_REVERSION".to_string(),
            generation_id: None,
            account_id: None,
            strategy_config: serde_json::json!({}),
            cached_metrics: None,
            stage_locked_reason: None,
            created_at: 0,
            updated_at: 0,
        }).unwrap();

        ledger.insert_trade(&closed_trade("t1", 75.0, 1.0, 1_000)).unwrap();
        ledger.insert_trade(&closed_trade("t2", -25.0, 1.0, 2_000)).unwrap();

        let computed = agg.recompute_and_cache("bot-1", "att-1").unwrap();

        let cached_json = ledger
            .get_bot("bot-1")
            .unwrap()
            .unwrap()
            .cached_metrics
            .unwrap();
        let cached: BotMetrics = serde_json::from_value(cached_json).unwrap();

        assert_eq!(computed, cached);
        assert!((cached.realized_pnl - 48.0).abs() < 1e-6);
    }
}
