// =============================================================================
// Accounts & attempts — blown-account bookkeeping
// =============================================================================
//
// An account's balance is derived, never stored: initial balance plus the
// net P&L of closed trades in the single ACTIVE attempt.  Blowing an
// account flips the active attempt to BLOWN and bumps the consecutive
// counter atomically; resetting opens attempt N+1.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::Ledger;
use crate::types::{AttemptStatus, ExitReason};

/// An account funding paper trading for one or more bots.
#[derive(Debug, Clone, Serialize)]
pub struct AccountRecord {
    pub id: String,
    pub initial_balance: f64,
    pub current_attempt_number: i64,
    pub consecutive_blown: i64,
    pub total_blown: i64,
}

/// One lifetime of an account between resets.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub id: String,
    pub account_id: String,
    pub attempt_number: i64,
    pub status: AttemptStatus,
    pub starting_balance: f64,
    pub ending_balance: Option<f64>,
    pub blown_reason: Option<String>,
    pub blown_at: Option<i64>,
    pub created_at: i64,
}

impl Ledger {
    /// Create an account with its first ACTIVE attempt.
    pub fn create_account(&self, id: &str, initial_balance: f64, now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to begin account create")?;
            tx.execute(
                "INSERT INTO accounts (id, initial_balance) VALUES (?1, ?2)",
                params![id, initial_balance],
            )
            .context("failed to insert account")?;
            tx.execute(
                "INSERT INTO account_attempts
                     (id, account_id, attempt_number, status, starting_balance, created_at)
                 VALUES (?1, ?2, 1, 'ACTIVE', ?3, ?4)",
                params![Uuid::new_v4().to_string(), id, initial_balance, now_ms],
            )
            .context("failed to insert first attempt")?;
            tx.commit().context("failed to commit account create")?;
            Ok(())
        })
    }

    pub fn get_account(&self, id: &str) -> Result<Option<AccountRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, initial_balance, current_attempt_number, consecutive_blown, total_blown
                 FROM accounts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AccountRecord {
                        id: row.get(0)?,
                        initial_balance: row.get(1)?,
                        current_attempt_number: row.get(2)?,
                        consecutive_blown: row.get(3)?,
                        total_blown: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("failed to read account")
        })
    }

    /// The single ACTIVE attempt for an account, if one exists.
    pub fn active_attempt(&self, account_id: &str) -> Result<Option<AttemptRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, account_id, attempt_number, status, starting_balance,
                        ending_balance, blown_reason, blown_at, created_at
                 FROM account_attempts
                 WHERE account_id = ?1 AND status = 'ACTIVE'
                 ORDER BY attempt_number DESC, id DESC LIMIT 1",
                params![account_id],
                row_to_attempt,
            )
            .optional()
            .context("failed to read active attempt")
        })
    }

    /// Derived balance: starting balance of the active attempt plus the net
    /// P&L of its closed trades (reconcile closures are flat by
    /// construction but excluded anyway).
    pub fn computed_balance(&self, account_id: &str) -> Result<Option<f64>> {
        let Some(attempt) = self.active_attempt(account_id)? else {
            return Ok(None);
        };
        self.with_conn(|conn| {
            let net: f64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(pnl - fees), 0) FROM paper_trades
                     WHERE account_attempt_id = ?1 AND status = 'CLOSED'
                       AND COALESCE(exit_reason, '') != ?2",
                    params![attempt.id, ExitReason::OrphanReconcile.as_str()],
                    |row| row.get(0),
                )
                .context("failed to sum attempt pnl")?;
            Ok(Some(attempt.starting_balance + net))
        })
    }

    /// Atomically mark the ACTIVE attempt BLOWN and bump the account's blown
    /// counters. Returns the new consecutive-blown count, or `None` when no
    /// attempt was active (the predicate already fired).
    pub fn mark_attempt_blown(
        &self,
        account_id: &str,
        reason: &str,
        ending_balance: f64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to begin blown update")?;

            let flipped = tx
                .execute(
                    "UPDATE account_attempts
                     SET status = 'BLOWN', blown_reason = ?2, blown_at = ?3, ending_balance = ?4
                     WHERE account_id = ?1 AND status = 'ACTIVE'",
                    params![account_id, reason, now_ms, ending_balance],
                )
                .context("failed to flip attempt to BLOWN")?;

            if flipped == 0 {
                tx.commit().ok();
                return Ok(None);
            }

            tx.execute(
                "UPDATE accounts
                 SET consecutive_blown = consecutive_blown + 1,
                     total_blown = total_blown + 1
                 WHERE id = ?1",
                params![account_id],
            )
            .context("failed to bump blown counters")?;

            let consecutive: i64 = tx
                .query_row(
                    "SELECT consecutive_blown FROM accounts WHERE id = ?1",
                    params![account_id],
                    |row| row.get(0),
                )
                .context("failed to read blown counter")?;

            tx.commit().context("failed to commit blown update")?;

            info!(account_id, reason, consecutive, "account attempt blown");
            Ok(Some(consecutive))
        })
    }

    /// Open a fresh ACTIVE attempt (`attempt_number + 1`) with a new
    /// starting balance. Returns the new attempt.
    pub fn reset_account_attempt(
        &self,
        account_id: &str,
        new_balance: f64,
        now_ms: i64,
    ) -> Result<AttemptRecord> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to begin attempt reset")?;

            let next_number: i64 = tx
                .query_row(
                    "UPDATE accounts
                     SET current_attempt_number = current_attempt_number + 1,
                         initial_balance = ?2
                     WHERE id = ?1
                     RETURNING current_attempt_number",
                    params![account_id, new_balance],
                    |row| row.get(0),
                )
                .context("failed to bump attempt number")?;

            let attempt = AttemptRecord {
                id: Uuid::new_v4().to_string(),
                account_id: account_id.to_string(),
                attempt_number: next_number,
                status: AttemptStatus::Active,
                starting_balance: new_balance,
                ending_balance: None,
                blown_reason: None,
                blown_at: None,
                created_at: now_ms,
            };

            tx.execute(
                "INSERT INTO account_attempts
                     (id, account_id, attempt_number, status, starting_balance, created_at)
                 VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?5)",
                params![
                    attempt.id,
                    attempt.account_id,
                    attempt.attempt_number,
                    attempt.starting_balance,
                    attempt.created_at
                ],
            )
            .context("failed to insert new attempt")?;

            tx.commit().context("failed to commit attempt reset")?;

            info!(account_id, attempt = next_number, "account reset for new attempt");
            Ok(attempt)
        })
    }

    /// Clear the consecutive counter after a successful (non-blown) cycle.
    pub fn clear_consecutive_blown(&self, account_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET consecutive_blown = 0 WHERE id = ?1",
                params![account_id],
            )
            .context("failed to clear consecutive blown")?;
            Ok(())
        })
    }
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttemptRecord> {
    let status: String = row.get(3)?;
    Ok(AttemptRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        attempt_number: row.get(2)?,
        status: AttemptStatus::parse(&status).unwrap_or(AttemptStatus::Blown),
        starting_balance: row.get(4)?,
        ending_balance: row.get(5)?,
        blown_reason: row.get(6)?,
        blown_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttemptStatus;

    #[test]
    fn create_account_opens_first_attempt() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_account("acct-1", 1_000.0, 100).unwrap();

        let account = ledger.get_account("acct-1").unwrap().unwrap();
        assert_eq!(account.current_attempt_number, 1);
        assert_eq!(account.consecutive_blown, 0);

        let attempt = ledger.active_attempt("acct-1").unwrap().unwrap();
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.status, AttemptStatus::Active);
        assert!((attempt.starting_balance - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn blown_flip_is_idempotent_and_counts() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_account("acct-1", 1_000.0, 100).unwrap();

        let first = ledger
            .mark_attempt_blown("acct-1", "BALANCE_DEPLETED", -5.0, 200)
            .unwrap();
        assert_eq!(first, Some(1));

        // Second call finds no ACTIVE attempt: the predicate already fired.
        let second = ledger
            .mark_attempt_blown("acct-1", "BALANCE_DEPLETED", -5.0, 300)
            .unwrap();
        assert_eq!(second, None);

        let account = ledger.get_account("acct-1").unwrap().unwrap();
        assert_eq!(account.consecutive_blown, 1);
        assert_eq!(account.total_blown, 1);
        assert!(ledger.active_attempt("acct-1").unwrap().is_none());
    }

    #[test]
    fn reset_opens_next_attempt() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_account("acct-1", 1_000.0, 100).unwrap();
        ledger
            .mark_attempt_blown("acct-1", "BALANCE_DEPLETED", 0.0, 200)
            .unwrap();

        let attempt = ledger.reset_account_attempt("acct-1", 1_500.0, 300).unwrap();
        assert_eq!(attempt.attempt_number, 2);
        assert_eq!(attempt.status, AttemptStatus::Active);

        let active = ledger.active_attempt("acct-1").unwrap().unwrap();
        assert_eq!(active.id, attempt.id);
        assert!((active.starting_balance - 1_500.0).abs() < 1e-9);

        let account = ledger.get_account("acct-1").unwrap().unwrap();
        assert_eq!(account.current_attempt_number, 2);
    }

    #[test]
    fn consecutive_counter_accumulates_and_clears() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_account("acct-1", 1_000.0, 100).unwrap();

        for i in 0..3 {
            let n = ledger
                .mark_attempt_blown("acct-1", "BALANCE_DEPLETED", 0.0, 200 + i)
                .unwrap();
            assert_eq!(n, Some(i + 1));
            ledger.reset_account_attempt("acct-1", 1_000.0, 300 + i).unwrap();
        }

        let account = ledger.get_account("acct-1").unwrap().unwrap();
        assert_eq!(account.consecutive_blown, 3);
        assert_eq!(account.total_blown, 3);

        ledger.clear_consecutive_blown("acct-1").unwrap();
        let account = ledger.get_account("acct-1").unwrap().unwrap();
        assert_eq!(account.consecutive_blown, 0);
        assert_eq!(account.total_blown, 3);
    }

    #[test]
    fn computed_balance_without_trades_is_starting_balance() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_account("acct-1", 2_500.0, 100).unwrap();
        let balance = ledger.computed_balance("acct-1").unwrap();
        assert_eq!(balance, Some(2_500.0));
        assert_eq!(ledger.computed_balance("missing").unwrap(), None);
    }
}
