// =============================================================================
// Ledger — durable control-plane store (SQLite)
// =============================================================================
//
// One database holds bots, bot instances, accounts, account attempts, paper
// trades, background jobs, and the append-only audit log.  The paper-trade
// table is the system of record: every metric is recomputable from it.
//
// Writer discipline:
//   - A paper runner is the sole writer for its own trades.
//   - Counter updates (blown counts, job attempts) are single UPDATE
//     statements, atomic under SQLite's writer lock.
//   - "Latest of" queries order by (timestamp DESC, id DESC) so ties break
//     deterministically.
// =============================================================================

pub mod accounts;
pub mod trades;

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{BotStage, InstanceState};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bots (
    id                  TEXT PRIMARY KEY,
    symbol              TEXT NOT NULL,
    stage               TEXT NOT NULL,
    archetype           TEXT NOT NULL,
    generation_id       TEXT,
    account_id          TEXT,
    strategy_config     TEXT NOT NULL DEFAULT '{}',
    cached_metrics      TEXT,
    stage_locked_reason TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_instances (
    bot_id            TEXT PRIMARY KEY,
    account_id        TEXT NOT NULL,
    state             TEXT NOT NULL,
    last_heartbeat_ms INTEGER,
    awaiting_recovery INTEGER NOT NULL DEFAULT 0,
    ready_for_restart INTEGER NOT NULL DEFAULT 0,
    updated_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id                     TEXT PRIMARY KEY,
    initial_balance        REAL NOT NULL,
    current_attempt_number INTEGER NOT NULL DEFAULT 1,
    consecutive_blown      INTEGER NOT NULL DEFAULT 0,
    total_blown            INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS account_attempts (
    id               TEXT PRIMARY KEY,
    account_id       TEXT NOT NULL,
    attempt_number   INTEGER NOT NULL,
    status           TEXT NOT NULL,
    starting_balance REAL NOT NULL,
    ending_balance   REAL,
    blown_reason     TEXT,
    blown_at         INTEGER,
    created_at       INTEGER NOT NULL,
    UNIQUE (account_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS paper_trades (
    id                 TEXT PRIMARY KEY,
    bot_id             TEXT NOT NULL,
    account_attempt_id TEXT NOT NULL,
    symbol             TEXT NOT NULL,
    side               TEXT NOT NULL,
    qty                REAL NOT NULL,
    entry_price        REAL NOT NULL,
    entry_ts           INTEGER NOT NULL,
    entry_bar_ts       INTEGER NOT NULL,
    exit_price         REAL,
    exit_ts            INTEGER,
    status             TEXT NOT NULL,
    exit_reason        TEXT,
    pnl                REAL NOT NULL DEFAULT 0,
    fees               REAL NOT NULL DEFAULT 0,
    slippage           REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_trades_bot_status
    ON paper_trades(bot_id, status, entry_ts DESC);
CREATE INDEX IF NOT EXISTS idx_trades_attempt
    ON paper_trades(account_attempt_id, status);
CREATE INDEX IF NOT EXISTS idx_trades_fingerprint
    ON paper_trades(symbol, entry_bar_ts, status);

CREATE TABLE IF NOT EXISTS bot_jobs (
    id                TEXT PRIMARY KEY,
    bot_id            TEXT,
    job_type          TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'QUEUED',
    priority          INTEGER,
    lease_owner       TEXT,
    lease_expires_at  INTEGER,
    last_heartbeat_at INTEGER,
    started_at        INTEGER,
    attempts          INTEGER NOT NULL DEFAULT 0,
    payload           TEXT,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON bot_jobs(status, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS audit_events (
    id         TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    bot_id     TEXT,
    symbol     TEXT,
    detail     TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_recent
    ON audit_events(created_at DESC);
"#;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A strategy bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotRecord {
    pub id: String,
    pub symbol: String,
    pub stage: BotStage,
    pub archetype: String,
    pub generation_id: Option<String>,
    pub account_id: Option<String>,
    pub strategy_config: serde_json::Value,
    pub cached_metrics: Option<serde_json::Value>,
    pub stage_locked_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A runner assignment binding a bot to an account.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub bot_id: String,
    pub account_id: String,
    pub state: InstanceState,
    pub last_heartbeat_ms: Option<i64>,
    pub awaiting_recovery: bool,
    pub ready_for_restart: bool,
    pub updated_at: i64,
}

/// One row in the append-only audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: String,
    pub bot_id: Option<String>,
    pub symbol: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Handle to the control-plane database. Cheap to clone; all clones share
/// one connection guarded by a mutex (statements are short-lived).
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("failed to open ledger at {path}"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory ledger")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply ledger schema")?;
        info!("ledger ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the shared connection. Crate-internal: the job queue and
    /// metrics aggregator issue their own SQL through this.
    pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    // -------------------------------------------------------------------------
    // Bots
    // -------------------------------------------------------------------------

    /// Insert or update a bot. `strategy_config` is merged field-wise with
    /// the stored config so server-owned fields survive partial updates;
    /// last writer wins at the row level via `updated_at`.
    pub fn upsert_bot(&self, bot: &BotRecord) -> Result<()> {
        let conn = self.conn.lock();

        let existing: Option<(String, i64)> = conn
            .query_row(
                "SELECT strategy_config, updated_at FROM bots WHERE id = ?1",
                params![bot.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read existing bot")?;

        let merged_config = match &existing {
            Some((stored, _)) => {
                let stored: serde_json::Value =
                    serde_json::from_str(stored).unwrap_or_else(|_| serde_json::json!({}));
                merge_json(stored, bot.strategy_config.clone())
            }
            None => bot.strategy_config.clone(),
        };

        // Last-writer-wins: a stale update must not clobber a newer row.
        if let Some((_, stored_updated)) = existing {
            if stored_updated > bot.updated_at {
                debug!(bot_id = %bot.id, "skipping stale bot upsert");
                return Ok(());
            }
        }

        conn.execute(
            "INSERT INTO bots (id, symbol, stage, archetype, generation_id, account_id,
                               strategy_config, cached_metrics, stage_locked_reason,
                               created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 symbol = excluded.symbol,
                 stage = excluded.stage,
                 archetype = excluded.archetype,
                 generation_id = excluded.generation_id,
                 account_id = excluded.account_id,
                 strategy_config = excluded.strategy_config,
                 stage_locked_reason = excluded.stage_locked_reason,
                 updated_at = excluded.updated_at",
            params![
                bot.id,
                bot.symbol,
                bot.stage.as_str(),
                bot.archetype,
                bot.generation_id,
                bot.account_id,
                merged_config.to_string(),
                bot.cached_metrics.as_ref().map(|m| m.to_string()),
                bot.stage_locked_reason,
                bot.created_at,
                bot.updated_at,
            ],
        )
        .context("failed to upsert bot")?;
        Ok(())
    }

    pub fn get_bot(&self, id: &str) -> Result<Option<BotRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, symbol, stage, archetype, generation_id, account_id,
                    strategy_config, cached_metrics, stage_locked_reason,
                    created_at, updated_at
             FROM bots WHERE id = ?1",
            params![id],
            row_to_bot,
        )
        .optional()
        .context("failed to read bot")
    }

    pub fn list_bots(&self) -> Result<Vec<BotRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, stage, archetype, generation_id, account_id,
                    strategy_config, cached_metrics, stage_locked_reason,
                    created_at, updated_at
             FROM bots ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_bot)?;
        let mut bots = Vec::new();
        for row in rows {
            bots.push(row.context("failed to read bot row")?);
        }
        Ok(bots)
    }

    pub fn bots_for_account(&self, account_id: &str) -> Result<Vec<BotRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, stage, archetype, generation_id, account_id,
                    strategy_config, cached_metrics, stage_locked_reason,
                    created_at, updated_at
             FROM bots WHERE account_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![account_id], row_to_bot)?;
        let mut bots = Vec::new();
        for row in rows {
            bots.push(row.context("failed to read bot row")?);
        }
        Ok(bots)
    }

    pub fn set_bot_stage(
        &self,
        id: &str,
        stage: BotStage,
        locked_reason: Option<&str>,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bots SET stage = ?2, stage_locked_reason = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, stage.as_str(), locked_reason, now_ms],
        )
        .context("failed to update bot stage")?;
        Ok(())
    }

    pub fn set_cached_metrics(
        &self,
        id: &str,
        metrics: &serde_json::Value,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bots SET cached_metrics = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, metrics.to_string(), now_ms],
        )
        .context("failed to update cached metrics")?;
        Ok(())
    }

    pub fn clear_cached_metrics_for_account(&self, account_id: &str, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE bots SET cached_metrics = NULL, updated_at = ?2 WHERE account_id = ?1",
                params![account_id, now_ms],
            )
            .context("failed to clear cached metrics")?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    pub fn upsert_instance(&self, instance: &InstanceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_instances (bot_id, account_id, state, last_heartbeat_ms,
                                        awaiting_recovery, ready_for_restart, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(bot_id) DO UPDATE SET
                 account_id = excluded.account_id,
                 state = excluded.state,
                 last_heartbeat_ms = excluded.last_heartbeat_ms,
                 awaiting_recovery = excluded.awaiting_recovery,
                 ready_for_restart = excluded.ready_for_restart,
                 updated_at = excluded.updated_at",
            params![
                instance.bot_id,
                instance.account_id,
                instance.state.as_str(),
                instance.last_heartbeat_ms,
                instance.awaiting_recovery as i64,
                instance.ready_for_restart as i64,
                instance.updated_at,
            ],
        )
        .context("failed to upsert instance")?;
        Ok(())
    }

    pub fn get_instance(&self, bot_id: &str) -> Result<Option<InstanceRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT bot_id, account_id, state, last_heartbeat_ms, awaiting_recovery,
                    ready_for_restart, updated_at
             FROM bot_instances WHERE bot_id = ?1",
            params![bot_id],
            row_to_instance,
        )
        .optional()
        .context("failed to read instance")
    }

    pub fn set_instance_state(&self, bot_id: &str, state: InstanceState, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bot_instances SET state = ?2, updated_at = ?3 WHERE bot_id = ?1",
            params![bot_id, state.as_str(), now_ms],
        )
        .context("failed to update instance state")?;
        Ok(())
    }

    pub fn touch_instance_heartbeat(&self, bot_id: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bot_instances SET last_heartbeat_ms = ?2, updated_at = ?2 WHERE bot_id = ?1",
            params![bot_id, now_ms],
        )
        .context("failed to touch instance heartbeat")?;
        Ok(())
    }

    /// Instances whose state claims activity (used by the kill-switch sweep).
    pub fn instances_in_states(&self, states: &[InstanceState]) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bot_id, account_id, state, last_heartbeat_ms, awaiting_recovery,
                    ready_for_restart, updated_at
             FROM bot_instances ORDER BY bot_id ASC",
        )?;
        let rows = stmt.query_map([], row_to_instance)?;
        let mut out = Vec::new();
        for row in rows {
            let inst = row.context("failed to read instance row")?;
            if states.contains(&inst.state) {
                out.push(inst);
            }
        }
        Ok(out)
    }

    /// Startup hygiene: any instance left in an active-looking state by a
    /// previous process is reset to Idle. The first session evaluation after
    /// start rewrites the real state.
    pub fn reset_stale_activity_states(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE bot_instances SET state = 'IDLE', updated_at = ?1
                 WHERE state IN ('SCANNING', 'IN_TRADE', 'EXITING', 'MAINTENANCE', 'DATA_FROZEN')",
                params![now_ms],
            )
            .context("failed to reset stale activity states")?;
        Ok(n)
    }

    pub fn set_awaiting_recovery_for_account(
        &self,
        account_id: &str,
        awaiting: bool,
        now_ms: i64,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE bot_instances
                 SET awaiting_recovery = ?2, ready_for_restart = ?3, updated_at = ?4
                 WHERE account_id = ?1",
                params![account_id, awaiting as i64, (!awaiting) as i64, now_ms],
            )
            .context("failed to update recovery flags")?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // Audit log
    // -------------------------------------------------------------------------

    /// Append one audit event. Never fails the caller's flow: the id is
    /// returned for correlation.
    pub fn audit(
        &self,
        event_type: &str,
        bot_id: Option<&str>,
        symbol: Option<&str>,
        detail: Option<&serde_json::Value>,
        now_ms: i64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_events (id, event_type, bot_id, symbol, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                event_type,
                bot_id,
                symbol,
                detail.map(|d| d.to_string()),
                now_ms
            ],
        )
        .context("failed to append audit event")?;
        Ok(id)
    }

    /// Most recent audit events, newest first, deterministic tie-break.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, bot_id, symbol, detail, created_at
             FROM audit_events ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let detail: Option<String> = row.get(4)?;
            Ok(AuditEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                bot_id: row.get(2)?,
                symbol: row.get(3)?,
                detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read audit row")?);
        }
        Ok(out)
    }

    /// Count of audit events of a given type (used by tests and invariants).
    pub fn audit_count(&self, event_type: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM audit_events WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )
        .context("failed to count audit events")
    }
}

// ---------------------------------------------------------------------------
// Row mappers & helpers
// ---------------------------------------------------------------------------

fn row_to_bot(row: &rusqlite::Row<'_>) -> rusqlite::Result<BotRecord> {
    let stage: String = row.get(2)?;
    let config: String = row.get(6)?;
    let metrics: Option<String> = row.get(7)?;
    Ok(BotRecord {
        id: row.get(0)?,
        symbol: row.get(1)?,
        stage: BotStage::parse(&stage).unwrap_or(BotStage::Trials),
        archetype: row.get(3)?,
        generation_id: row.get(4)?,
        account_id: row.get(5)?,
        strategy_config: serde_json::from_str(&config).unwrap_or_else(|_| serde_json::json!({})),
        cached_metrics: metrics.and_then(|m| serde_json::from_str(&m).ok()),
        stage_locked_reason: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let state: String = row.get(2)?;
    Ok(InstanceRecord {
        bot_id: row.get(0)?,
        account_id: row.get(1)?,
        state: InstanceState::parse(&state).unwrap_or(InstanceState::Stopped),
        last_heartbeat_ms: row.get(3)?,
        awaiting_recovery: row.get::<_, i64>(4)? != 0,
        ready_for_restart: row.get::<_, i64>(5)? != 0,
        updated_at: row.get(6)?,
    })
}

/// Shallow field-wise merge: keys present in `patch` win, keys only in
/// `base` survive. Non-object inputs fall back to `patch`.
pub fn merge_json(base: serde_json::Value, patch: serde_json::Value) -> serde_json::Value {
    match (base, patch) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
            serde_json::Value::Object(base)
        }
        (_, patch) => patch,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bot(id: &str, updated_at: i64) -> BotRecord {
        BotRecord {
            id: id.to_string(),
            symbol: "MES".to_string(),
            stage: BotStage::Trials,
            archetype: "MEAN_REVERSION".to_string(),
            generation_id: None,
            account_id: Some("acct-1".to_string()),
            strategy_config: json!({ "stop_ticks": 20 }),
            cached_metrics: None,
            stage_locked_reason: None,
            created_at: 1_000,
            updated_at,
        }
    }

    #[test]
    fn bot_upsert_merges_strategy_config() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut b = bot("bot-1", 1_000);
        b.strategy_config = json!({ "stop_ticks": 20, "server_field": "keep-me" });
        ledger.upsert_bot(&b).unwrap();

        // Partial update: only stop_ticks changes; server_field must survive.
        let mut update = bot("bot-1", 2_000);
        update.strategy_config = json!({ "stop_ticks": 25 });
        ledger.upsert_bot(&update).unwrap();

        let stored = ledger.get_bot("bot-1").unwrap().unwrap();
        assert_eq!(stored.strategy_config["stop_ticks"], 25);
        assert_eq!(stored.strategy_config["server_field"], "keep-me");
    }

    #[test]
    fn stale_bot_upsert_is_ignored() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.upsert_bot(&bot("bot-1", 5_000)).unwrap();

        let mut stale = bot("bot-1", 4_000);
        stale.symbol = "MNQ".to_string();
        ledger.upsert_bot(&stale).unwrap();

        let stored = ledger.get_bot("bot-1").unwrap().unwrap();
        assert_eq!(stored.symbol, "MES");
        assert_eq!(stored.updated_at, 5_000);
    }

    #[test]
    fn stage_updates_and_locking() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.upsert_bot(&bot("bot-1", 1_000)).unwrap();
        ledger
            .set_bot_stage("bot-1", BotStage::Paper, None, 2_000)
            .unwrap();
        let stored = ledger.get_bot("bot-1").unwrap().unwrap();
        assert_eq!(stored.stage, BotStage::Paper);

        ledger
            .set_bot_stage(
                "bot-1",
                BotStage::Trials,
                Some("BLOWN_ACCOUNT_DEMOTION"),
                3_000,
            )
            .unwrap();
        let stored = ledger.get_bot("bot-1").unwrap().unwrap();
        assert_eq!(stored.stage, BotStage::Trials);
        assert_eq!(
            stored.stage_locked_reason.as_deref(),
            Some("BLOWN_ACCOUNT_DEMOTION")
        );
    }

    #[test]
    fn instance_lifecycle_and_stale_reset() {
        let ledger = Ledger::open_in_memory().unwrap();
        let inst = InstanceRecord {
            bot_id: "bot-1".to_string(),
            account_id: "acct-1".to_string(),
            state: InstanceState::InTrade,
            last_heartbeat_ms: Some(1_000),
            awaiting_recovery: false,
            ready_for_restart: false,
            updated_at: 1_000,
        };
        ledger.upsert_instance(&inst).unwrap();

        let n = ledger.reset_stale_activity_states(2_000).unwrap();
        assert_eq!(n, 1);
        let stored = ledger.get_instance("bot-1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Idle);

        // Stopped instances are left alone.
        ledger
            .set_instance_state("bot-1", InstanceState::Stopped, 3_000)
            .unwrap();
        assert_eq!(ledger.reset_stale_activity_states(4_000).unwrap(), 0);
    }

    #[test]
    fn recovery_flags_scoped_to_account() {
        let ledger = Ledger::open_in_memory().unwrap();
        for (bot_id, account) in [("bot-1", "acct-1"), ("bot-2", "acct-1"), ("bot-3", "acct-2")] {
            ledger
                .upsert_instance(&InstanceRecord {
                    bot_id: bot_id.to_string(),
                    account_id: account.to_string(),
                    state: InstanceState::Idle,
                    last_heartbeat_ms: None,
                    awaiting_recovery: true,
                    ready_for_restart: false,
                    updated_at: 1_000,
                })
                .unwrap();
        }

        let n = ledger
            .set_awaiting_recovery_for_account("acct-1", false, 2_000)
            .unwrap();
        assert_eq!(n, 2);

        let b1 = ledger.get_instance("bot-1").unwrap().unwrap();
        assert!(!b1.awaiting_recovery);
        assert!(b1.ready_for_restart);

        let b3 = ledger.get_instance("bot-3").unwrap().unwrap();
        assert!(b3.awaiting_recovery);
    }

    #[test]
    fn audit_round_trip() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .audit(
                "ORDER_BLOCKED_RISK",
                Some("bot-1"),
                Some("MES"),
                Some(&json!({ "code": "DUPLICATE_TRADE_GUARDRAIL" })),
                1_000,
            )
            .unwrap();
        ledger.audit("SESSION_END", None, None, None, 2_000).unwrap();

        let events = ledger.recent_audit(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "SESSION_END");
        assert_eq!(events[1].detail.as_ref().unwrap()["code"], "DUPLICATE_TRADE_GUARDRAIL");
        assert_eq!(ledger.audit_count("ORDER_BLOCKED_RISK").unwrap(), 1);
    }

    #[test]
    fn merge_json_shallow() {
        let merged = merge_json(
            json!({ "a": 1, "b": 2 }),
            json!({ "b": 3, "c": 4 }),
        );
        assert_eq!(merged, json!({ "a": 1, "b": 3, "c": 4 }));
        assert_eq!(merge_json(json!(null), json!({ "x": 1 })), json!({ "x": 1 }));
    }
}
