// =============================================================================
// Blown-Account Recovery — attempt lifecycle and demote-vs-improve
// =============================================================================
//
// The blown predicate runs after every trade close: when the derived
// balance reaches zero the ACTIVE attempt flips to BLOWN atomically and a
// recovery job is enqueued.  Side-effects (stopping runners, demoting or
// queueing improvement work) run when that job is claimed, never inline
// with the close — the queue breaks the runner/recovery cycle.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::jobs::queue::{JobQueue, JOB_TYPE_IMPROVING, JOB_TYPE_RECOVERY};
use crate::ledger::Ledger;
use crate::types::{BotStage, InstanceState};

/// Reason code stamped on a balance-depleted attempt.
pub const BLOWN_REASON_BALANCE: &str = "BALANCE_DEPLETED";
/// Stage-lock reason for demoted bots.
pub const DEMOTION_REASON: &str = "BLOWN_ACCOUNT_DEMOTION";
/// Consecutive blown attempts before demotion replaces improvement.
const DEMOTE_AFTER_CONSECUTIVE: i64 = 3;

/// What the blown predicate decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlownOutcome {
    /// Balance positive, nothing to do.
    Healthy,
    /// Attempt flipped to BLOWN; recovery job enqueued.
    Blown { consecutive: i64 },
}

/// Account-recovery engine.
#[derive(Clone)]
pub struct BlownAccountRecovery {
    ledger: Ledger,
    queue: JobQueue,
    clock: SharedClock,
}

impl BlownAccountRecovery {
    pub fn new(ledger: Ledger, queue: JobQueue, clock: SharedClock) -> Self {
        Self {
            ledger,
            queue,
            clock,
        }
    }

    // -------------------------------------------------------------------------
    // Predicate
    // -------------------------------------------------------------------------

    /// Evaluate the blown predicate for an account. Flips the attempt and
    /// enqueues the deferred recovery job when the balance is depleted.
    pub fn check_account(&self, account_id: &str) -> Result<BlownOutcome> {
        let Some(balance) = self
            .ledger
            .computed_balance(account_id)
            .context("failed to compute balance")?
        else {
            // No active attempt: a previous check already fired.
            return Ok(BlownOutcome::Healthy);
        };

        if balance > 0.0 {
            return Ok(BlownOutcome::Healthy);
        }

        let now = self.clock.now_ms();
        let Some(consecutive) = self
            .ledger
            .mark_attempt_blown(account_id, BLOWN_REASON_BALANCE, balance, now)?
        else {
            return Ok(BlownOutcome::Healthy);
        };

        warn!(account_id, balance, consecutive, "account blown");

        self.ledger.audit(
            "ACCOUNT_BLOWN",
            None,
            None,
            Some(&json!({
                "account_id": account_id,
                "balance": balance,
                "reason": BLOWN_REASON_BALANCE,
                "consecutive": consecutive,
            })),
            now,
        )?;

        // Flag instances so runners refuse to restart until reset.
        self.ledger
            .set_awaiting_recovery_for_account(account_id, true, now)?;

        // Side-effects run on the next scheduler tick via the job queue.
        self.queue.enqueue(
            None,
            JOB_TYPE_RECOVERY,
            Some(100),
            Some(json!({ "account_id": account_id, "consecutive": consecutive })),
        )?;

        Ok(BlownOutcome::Blown { consecutive })
    }

    // -------------------------------------------------------------------------
    // Deferred side-effects (run from the recovery job)
    // -------------------------------------------------------------------------

    /// Apply demote-vs-improve to every bot attached to the account. The
    /// caller (job handler) stops the account's runners before this runs.
    pub fn run_recovery(&self, account_id: &str, consecutive: i64) -> Result<()> {
        let now = self.clock.now_ms();
        let bots = self.ledger.bots_for_account(account_id)?;

        for bot in &bots {
            // Any instance still claiming activity is stopped in the ledger.
            if let Some(instance) = self.ledger.get_instance(&bot.id)? {
                if instance.state != InstanceState::Stopped {
                    self.ledger
                        .set_instance_state(&bot.id, InstanceState::Stopped, now)?;
                }
            }

            if consecutive >= DEMOTE_AFTER_CONSECUTIVE {
                self.ledger
                    .set_bot_stage(&bot.id, BotStage::Trials, Some(DEMOTION_REASON), now)?;
                self.ledger.audit(
                    "BOT_DEMOTED",
                    Some(&bot.id),
                    Some(&bot.symbol),
                    Some(&json!({
                        "reason": DEMOTION_REASON,
                        "from_stage": bot.stage,
                        "consecutive": consecutive,
                    })),
                    now,
                )?;
                info!(bot_id = %bot.id, from = %bot.stage, "bot demoted to TRIALS");
            } else {
                // Idempotent: a pending improvement pass is not duplicated.
                let queued = self.queue.enqueue_idempotent(
                    &bot.id,
                    JOB_TYPE_IMPROVING,
                    Some(50),
                    Some(json!({ "account_id": account_id })),
                )?;
                if queued.is_some() {
                    info!(bot_id = %bot.id, "improvement job queued");
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Fund a new attempt and clear recovery state so runners may restart.
    pub fn reset_for_new_attempt(&self, account_id: &str, new_balance: f64) -> Result<()> {
        let now = self.clock.now_ms();

        let attempt = self
            .ledger
            .reset_account_attempt(account_id, new_balance, now)?;

        self.ledger
            .clear_cached_metrics_for_account(account_id, now)?;
        self.ledger
            .set_awaiting_recovery_for_account(account_id, false, now)?;

        self.ledger.audit(
            "ACCOUNT_RESET",
            None,
            None,
            Some(&json!({
                "account_id": account_id,
                "attempt_number": attempt.attempt_number,
                "starting_balance": new_balance,
            })),
            now,
        )?;

        info!(
            account_id,
            attempt = attempt.attempt_number,
            "account ready for restart"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::ledger::trades::PaperTradeRecord;
    use crate::ledger::{BotRecord, InstanceRecord};
    use crate::types::{ExitReason, TradeSide, TradeStatus};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        recovery: BlownAccountRecovery,
        ledger: Ledger,
        queue: JobQueue,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap());
        let ledger = Ledger::open_in_memory().unwrap();
        let queue = JobQueue::new(ledger.clone(), clock.clone());
        let recovery = BlownAccountRecovery::new(ledger.clone(), queue.clone(), clock);
        Fixture {
            recovery,
            ledger,
            queue,
        }
    }

    fn seed_account_with_bots(f: &Fixture, stage: BotStage) {
        f.ledger.create_account("acct-1", 1_000.0, 100).unwrap();
        for bot_id in ["bot-1", "bot-2"] {
            f.ledger
                .upsert_bot(&BotRecord {
                    id: bot_id.to_string(),
                    symbol: "MES".to_string(),
                    stage,
                    archetype: "MEAN_REVERSION".to_string(),
                    generation_id: None,
                    account_id: Some("acct-1".to_string()),
                    strategy_config: serde_json::json!({}),
                    cached_metrics: Some(serde_json::json!({ "realized_pnl": 1.0 })),
                    stage_locked_reason: None,
                    created_at: 100,
                    updated_at: 100,
                })
                .unwrap();
            f.ledger
                .upsert_instance(&InstanceRecord {
                    bot_id: bot_id.to_string(),
                    account_id: "acct-1".to_string(),
                    state: InstanceState::Scanning,
                    last_heartbeat_ms: None,
                    awaiting_recovery: false,
                    ready_for_restart: false,
                    updated_at: 100,
                })
                .unwrap();
        }
    }

    fn losing_trade(f: &Fixture, id: &str, pnl: f64) {
        let attempt = f.ledger.active_attempt("acct-1").unwrap().unwrap();
        f.ledger
            .insert_trade(&PaperTradeRecord {
                id: id.to_string(),
                bot_id: "bot-1".to_string(),
                account_attempt_id: attempt.id,
                symbol: "MES".to_string(),
                side: TradeSide::Buy,
                qty: 1.0,
                entry_price: 5000.0,
                entry_ts: 1_000,
                entry_bar_ts: 1_000,
                exit_price: Some(4000.0),
                exit_ts: Some(2_000),
                status: TradeStatus::Closed,
                exit_reason: Some(ExitReason::StopLoss),
                pnl,
                fees: 0.0,
                slippage: 0.0,
            })
            .unwrap();
    }

    #[test]
    fn healthy_account_passes_predicate() {
        let f = fixture();
        seed_account_with_bots(&f, BotStage::Paper);
        assert_eq!(
            f.recovery.check_account("acct-1").unwrap(),
            BlownOutcome::Healthy
        );
    }

    #[test]
    fn depleted_balance_blows_and_enqueues_recovery() {
        let f = fixture();
        seed_account_with_bots(&f, BotStage::Paper);
        losing_trade(&f, "t-1", -1_005.0); // balance -> -5

        let outcome = f.recovery.check_account("acct-1").unwrap();
        assert_eq!(outcome, BlownOutcome::Blown { consecutive: 1 });

        assert!(f.ledger.active_attempt("acct-1").unwrap().is_none());
        assert_eq!(f.ledger.audit_count("ACCOUNT_BLOWN").unwrap(), 1);

        // Instances flagged.
        let inst = f.ledger.get_instance("bot-1").unwrap().unwrap();
        assert!(inst.awaiting_recovery);

        // Recovery job waiting.
        let job = f.queue.claim("w-1", 60, Some(JOB_TYPE_RECOVERY)).unwrap().unwrap();
        assert_eq!(job.payload.as_ref().unwrap()["account_id"], "acct-1");

        // Re-running the predicate is a no-op.
        assert_eq!(
            f.recovery.check_account("acct-1").unwrap(),
            BlownOutcome::Healthy
        );
    }

    #[test]
    fn below_threshold_queues_improving_jobs() {
        let f = fixture();
        seed_account_with_bots(&f, BotStage::Paper);

        f.recovery.run_recovery("acct-1", 2).unwrap();

        // One idempotent improving job per bot; stage untouched.
        for bot_id in ["bot-1", "bot-2"] {
            let bot = f.ledger.get_bot(bot_id).unwrap().unwrap();
            assert_eq!(bot.stage, BotStage::Paper);
        }
        let stats = f.queue.stats().unwrap();
        assert_eq!(stats.queued, 2);

        // Running recovery again does not duplicate pending jobs.
        f.recovery.run_recovery("acct-1", 2).unwrap();
        assert_eq!(f.queue.stats().unwrap().queued, 2);
    }

    #[test]
    fn at_threshold_demotes_to_trials() {
        let f = fixture();
        seed_account_with_bots(&f, BotStage::Shadow);

        f.recovery.run_recovery("acct-1", 3).unwrap();

        for bot_id in ["bot-1", "bot-2"] {
            let bot = f.ledger.get_bot(bot_id).unwrap().unwrap();
            assert_eq!(bot.stage, BotStage::Trials);
            assert_eq!(bot.stage_locked_reason.as_deref(), Some(DEMOTION_REASON));

            let inst = f.ledger.get_instance(bot_id).unwrap().unwrap();
            assert_eq!(inst.state, InstanceState::Stopped);
        }
        assert_eq!(f.ledger.audit_count("BOT_DEMOTED").unwrap(), 2);
        // No improving jobs at the demotion threshold.
        assert_eq!(f.queue.stats().unwrap().queued, 0);
    }

    #[test]
    fn reset_opens_attempt_and_clears_state() {
        let f = fixture();
        seed_account_with_bots(&f, BotStage::Paper);
        losing_trade(&f, "t-1", -1_005.0);
        f.recovery.check_account("acct-1").unwrap();

        f.recovery.reset_for_new_attempt("acct-1", 1_500.0).unwrap();

        let attempt = f.ledger.active_attempt("acct-1").unwrap().unwrap();
        assert_eq!(attempt.attempt_number, 2);
        assert!((attempt.starting_balance - 1_500.0).abs() < 1e-9);

        // Cached metrics zeroed, recovery flags cleared.
        let bot = f.ledger.get_bot("bot-1").unwrap().unwrap();
        assert!(bot.cached_metrics.is_none());
        let inst = f.ledger.get_instance("bot-1").unwrap().unwrap();
        assert!(!inst.awaiting_recovery);
        assert!(inst.ready_for_restart);

        // New attempt's balance is clean.
        assert_eq!(f.ledger.computed_balance("acct-1").unwrap(), Some(1_500.0));
    }

    #[test]
    fn scenario_blown_mid_session() {
        // Consecutive was 2; this blow makes 3 -> demotion path.
        let f = fixture();
        seed_account_with_bots(&f, BotStage::Paper);

        // Two prior blown attempts.
        for _ in 0..2 {
            f.ledger
                .mark_attempt_blown("acct-1", BLOWN_REASON_BALANCE, 0.0, 150)
                .unwrap();
            f.ledger.reset_account_attempt("acct-1", 1_000.0, 160).unwrap();
        }

        losing_trade(&f, "t-1", -1_005.0);
        let outcome = f.recovery.check_account("acct-1").unwrap();
        assert_eq!(outcome, BlownOutcome::Blown { consecutive: 3 });

        let attempt_rows = f.ledger.with_conn(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM account_attempts WHERE account_id = 'acct-1' AND status = 'BLOWN'",
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            Ok(n)
        }).unwrap();
        assert_eq!(attempt_rows, 3);

        f.recovery.run_recovery("acct-1", 3).unwrap();
        assert_eq!(
            f.ledger.get_bot("bot-1").unwrap().unwrap().stage,
            BotStage::Trials
        );
    }
}
