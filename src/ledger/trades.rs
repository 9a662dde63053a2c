// =============================================================================
// Paper trades — the system of record for simulated fills
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use super::Ledger;
use crate::types::{ExitReason, TradeSide, TradeStatus};

/// One simulated trade in the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct PaperTradeRecord {
    pub id: String,
    pub bot_id: String,
    pub account_attempt_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_ts: i64,
    /// Open timestamp of the bar whose close triggered the entry. The
    /// cross-bot duplicate guard fingerprints on this.
    pub entry_bar_ts: i64,
    pub exit_price: Option<f64>,
    pub exit_ts: Option<i64>,
    pub status: TradeStatus,
    pub exit_reason: Option<ExitReason>,
    pub pnl: f64,
    pub fees: f64,
    pub slippage: f64,
}

impl Ledger {
    pub fn insert_trade(&self, trade: &PaperTradeRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO paper_trades
                     (id, bot_id, account_attempt_id, symbol, side, qty, entry_price,
                      entry_ts, entry_bar_ts, exit_price, exit_ts, status, exit_reason,
                      pnl, fees, slippage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    trade.id,
                    trade.bot_id,
                    trade.account_attempt_id,
                    trade.symbol,
                    trade.side.as_str(),
                    trade.qty,
                    trade.entry_price,
                    trade.entry_ts,
                    trade.entry_bar_ts,
                    trade.exit_price,
                    trade.exit_ts,
                    trade.status.as_str(),
                    trade.exit_reason.map(|r| r.as_str()),
                    trade.pnl,
                    trade.fees,
                    trade.slippage,
                ],
            )
            .context("failed to insert paper trade")?;
            debug!(trade_id = %trade.id, bot_id = %trade.bot_id, "paper trade inserted");
            Ok(())
        })
    }

    /// OPEN trades for a bot within one account attempt, newest entry first
    /// with a deterministic tie-break. Under the single-position invariant
    /// this returns at most one row; more than one means orphans to
    /// reconcile.
    pub fn open_trades_for_bot(
        &self,
        bot_id: &str,
        account_attempt_id: &str,
    ) -> Result<Vec<PaperTradeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, bot_id, account_attempt_id, symbol, side, qty, entry_price,
                        entry_ts, entry_bar_ts, exit_price, exit_ts, status, exit_reason,
                        pnl, fees, slippage
                 FROM paper_trades
                 WHERE bot_id = ?1 AND account_attempt_id = ?2 AND status = 'OPEN'
                 ORDER BY entry_ts DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![bot_id, account_attempt_id], row_to_trade)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to read trade row")?);
            }
            Ok(out)
        })
    }

    pub fn get_trade(&self, id: &str) -> Result<Option<PaperTradeRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, bot_id, account_attempt_id, symbol, side, qty, entry_price,
                        entry_ts, entry_bar_ts, exit_price, exit_ts, status, exit_reason,
                        pnl, fees, slippage
                 FROM paper_trades WHERE id = ?1",
                params![id],
                row_to_trade,
            )
            .optional()
            .context("failed to read trade")
        })
    }

    /// Close an OPEN trade. Returns whether a row was actually closed.
    #[allow(clippy::too_many_arguments)]
    pub fn close_trade(
        &self,
        id: &str,
        exit_price: f64,
        exit_ts: i64,
        reason: ExitReason,
        pnl: f64,
        fees: f64,
        slippage: f64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE paper_trades
                     SET exit_price = ?2, exit_ts = ?3, status = 'CLOSED',
                         exit_reason = ?4, pnl = ?5, fees = ?6, slippage = ?7
                     WHERE id = ?1 AND status = 'OPEN'",
                    params![id, exit_price, exit_ts, reason.as_str(), pnl, fees, slippage],
                )
                .context("failed to close trade")?;
            Ok(n > 0)
        })
    }

    /// Cross-bot duplicate fingerprint: an OPEN trade from a *different*
    /// bot with the same (symbol, entry bar, entry price, side). Returns
    /// the offending bot id.
    pub fn find_duplicate_open(
        &self,
        symbol: &str,
        entry_bar_ts: i64,
        entry_price: f64,
        side: TradeSide,
        exclude_bot_id: &str,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT bot_id FROM paper_trades
                 WHERE symbol = ?1 AND entry_bar_ts = ?2 AND side = ?3
                   AND status = 'OPEN' AND bot_id != ?4
                   AND ABS(entry_price - ?5) < 1e-9
                 ORDER BY entry_ts DESC, id DESC LIMIT 1",
                params![symbol, entry_bar_ts, side.as_str(), exclude_bot_id, entry_price],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query duplicate fingerprint")
        })
    }

    /// Closed trades for one attempt in deterministic recovery order:
    /// `exit_ts ASC NULLS LAST, id ASC`.
    pub fn closed_trades_for_attempt(
        &self,
        account_attempt_id: &str,
    ) -> Result<Vec<PaperTradeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, bot_id, account_attempt_id, symbol, side, qty, entry_price,
                        entry_ts, entry_bar_ts, exit_price, exit_ts, status, exit_reason,
                        pnl, fees, slippage
                 FROM paper_trades
                 WHERE account_attempt_id = ?1 AND status = 'CLOSED'
                 ORDER BY (exit_ts IS NULL) ASC, exit_ts ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![account_attempt_id], row_to_trade)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to read trade row")?);
            }
            Ok(out)
        })
    }

    /// All trades for a bot scoped to one attempt, for metric recompute.
    pub fn trades_for_bot_attempt(
        &self,
        bot_id: &str,
        account_attempt_id: &str,
    ) -> Result<Vec<PaperTradeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, bot_id, account_attempt_id, symbol, side, qty, entry_price,
                        entry_ts, entry_bar_ts, exit_price, exit_ts, status, exit_reason,
                        pnl, fees, slippage
                 FROM paper_trades
                 WHERE bot_id = ?1 AND account_attempt_id = ?2
                 ORDER BY (exit_ts IS NULL) ASC, exit_ts ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![bot_id, account_attempt_id], row_to_trade)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to read trade row")?);
            }
            Ok(out)
        })
    }

    /// Count of OPEN trades for a bot in an attempt (invariant checks).
    pub fn count_open_for_bot(&self, bot_id: &str, account_attempt_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM paper_trades
                 WHERE bot_id = ?1 AND account_attempt_id = ?2 AND status = 'OPEN'",
                params![bot_id, account_attempt_id],
                |row| row.get(0),
            )
            .context("failed to count open trades")
        })
    }
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperTradeRecord> {
    let side: String = row.get(4)?;
    let status: String = row.get(11)?;
    let reason: Option<String> = row.get(12)?;
    Ok(PaperTradeRecord {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        account_attempt_id: row.get(2)?,
        symbol: row.get(3)?,
        side: TradeSide::parse(&side).unwrap_or(TradeSide::Buy),
        qty: row.get(5)?,
        entry_price: row.get(6)?,
        entry_ts: row.get(7)?,
        entry_bar_ts: row.get(8)?,
        exit_price: row.get(9)?,
        exit_ts: row.get(10)?,
        status: TradeStatus::parse(&status).unwrap_or(TradeStatus::Closed),
        exit_reason: reason.as_deref().and_then(ExitReason::parse),
        pnl: row.get(13)?,
        fees: row.get(14)?,
        slippage: row.get(15)?,
    })
}
