// =============================================================================
// Job Lease Queue — at-most-one worker per job
// =============================================================================
//
// Background work (evolution, backtests, improvement passes, recovery) is
// driven through leased jobs in the ledger.  A claim runs inside an
// IMMEDIATE transaction, so the select-and-mark is atomic under SQLite's
// writer lock and N workers can never claim the same job.  Lease renewal
// and release are conditional on (job, worker); expiry is detected by the
// sweep, never by in-flight workers.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::ledger::Ledger;
use crate::types::JobStatus;

/// Job types the plane understands.
pub const JOB_TYPE_IMPROVING: &str = "IMPROVING";
pub const JOB_TYPE_BACKTEST: &str = "BACKTEST";
pub const JOB_TYPE_EVOLUTION: &str = "EVOLUTION";
pub const JOB_TYPE_RECOVERY: &str = "ACCOUNT_RECOVERY";

/// One row in `bot_jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub bot_id: Option<String>,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: Option<i64>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub started_at: Option<i64>,
    pub attempts: i64,
    pub payload: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Queue depth by status, for the control surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub timeout: i64,
    pub done: i64,
    pub failed: i64,
}

/// Client for the leased job queue.
#[derive(Clone)]
pub struct JobQueue {
    ledger: Ledger,
    clock: SharedClock,
}

impl JobQueue {
    pub fn new(ledger: Ledger, clock: SharedClock) -> Self {
        Self { ledger, clock }
    }

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    pub fn enqueue(
        &self,
        bot_id: Option<&str>,
        job_type: &str,
        priority: Option<i64>,
        payload: Option<serde_json::Value>,
    ) -> Result<JobRecord> {
        let now = self.clock.now_ms();
        let job = JobRecord {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.map(str::to_string),
            job_type: job_type.to_string(),
            status: JobStatus::Queued,
            priority,
            lease_owner: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            started_at: None,
            attempts: 0,
            payload,
            created_at: now,
        };

        self.ledger.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bot_jobs
                     (id, bot_id, job_type, status, priority, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'QUEUED', ?4, ?5, ?6, ?6)",
                params![
                    job.id,
                    job.bot_id,
                    job.job_type,
                    job.priority,
                    job.payload.as_ref().map(|p| p.to_string()),
                    now
                ],
            )
            .context("failed to enqueue job")?;
            Ok(())
        })?;

        debug!(job_id = %job.id, job_type, "job enqueued");
        Ok(job)
    }

    /// Enqueue unless a QUEUED or RUNNING job of the same type already
    /// exists for the bot. Returns `None` when skipped.
    pub fn enqueue_idempotent(
        &self,
        bot_id: &str,
        job_type: &str,
        priority: Option<i64>,
        payload: Option<serde_json::Value>,
    ) -> Result<Option<JobRecord>> {
        let exists: bool = self.ledger.with_conn(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM bot_jobs
                     WHERE bot_id = ?1 AND job_type = ?2 AND status IN ('QUEUED', 'RUNNING')",
                    params![bot_id, job_type],
                    |row| row.get(0),
                )
                .context("failed to check for existing job")?;
            Ok(n > 0)
        })?;

        if exists {
            debug!(bot_id, job_type, "job already pending -- skipping enqueue");
            return Ok(None);
        }
        self.enqueue(Some(bot_id), job_type, priority, payload).map(Some)
    }

    // -------------------------------------------------------------------------
    // Claim / renew / release
    // -------------------------------------------------------------------------

    /// Atomically claim one job: highest priority first (unset priority
    /// last), then oldest. The select and the RUNNING transition commit in
    /// one IMMEDIATE transaction, so parallel workers never share a job.
    pub fn claim(
        &self,
        worker_id: &str,
        lease_secs: u64,
        job_type: Option<&str>,
    ) -> Result<Option<JobRecord>> {
        let now = self.clock.now_ms();
        let lease_until = now + (lease_secs as i64) * 1_000;

        self.ledger.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin claim transaction")?;

            let candidate: Option<String> = tx
                .query_row(
                    "SELECT id FROM bot_jobs
                     WHERE status = 'QUEUED'
                       AND (lease_owner IS NULL OR lease_expires_at < ?1)
                       AND (?2 IS NULL OR job_type = ?2)
                     ORDER BY (priority IS NULL) ASC, priority DESC, created_at ASC, id ASC
                     LIMIT 1",
                    params![now, job_type],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to select claimable job")?;

            let Some(job_id) = candidate else {
                tx.commit().ok();
                return Ok(None);
            };

            tx.execute(
                "UPDATE bot_jobs
                 SET status = 'RUNNING', lease_owner = ?2, lease_expires_at = ?3,
                     started_at = ?4, last_heartbeat_at = ?4,
                     attempts = attempts + 1, updated_at = ?4
                 WHERE id = ?1",
                params![job_id, worker_id, lease_until, now],
            )
            .context("failed to mark job RUNNING")?;

            let job = tx
                .query_row(
                    "SELECT id, bot_id, job_type, status, priority, lease_owner,
                            lease_expires_at, last_heartbeat_at, started_at, attempts,
                            payload, created_at
                     FROM bot_jobs WHERE id = ?1",
                    params![job_id],
                    row_to_job,
                )
                .context("failed to read claimed job")?;

            tx.commit().context("failed to commit claim")?;
            debug!(job_id = %job.id, worker_id, "job claimed");
            Ok(Some(job))
        })
    }

    /// Extend the lease. Succeeds only while `worker_id` owns the RUNNING
    /// job.
    pub fn renew(&self, job_id: &str, worker_id: &str, lease_secs: u64) -> Result<bool> {
        let now = self.clock.now_ms();
        let lease_until = now + (lease_secs as i64) * 1_000;
        self.ledger.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE bot_jobs SET lease_expires_at = ?3, updated_at = ?4
                     WHERE id = ?1 AND lease_owner = ?2 AND status = 'RUNNING'",
                    params![job_id, worker_id, lease_until, now],
                )
                .context("failed to renew lease")?;
            Ok(n > 0)
        })
    }

    /// Abandon a job: clear the lease and return it to QUEUED. Succeeds
    /// only for the current owner.
    pub fn release(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        self.ledger.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE bot_jobs
                     SET status = 'QUEUED', lease_owner = NULL, lease_expires_at = NULL,
                         updated_at = ?3
                     WHERE id = ?1 AND lease_owner = ?2",
                    params![job_id, worker_id, now],
                )
                .context("failed to release lease")?;
            Ok(n > 0)
        })
    }

    /// Finish a job as DONE or FAILED. Owner-conditional like release.
    pub fn complete(&self, job_id: &str, worker_id: &str, success: bool) -> Result<bool> {
        let now = self.clock.now_ms();
        let status = if success { "DONE" } else { "FAILED" };
        self.ledger.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE bot_jobs
                     SET status = ?3, lease_owner = NULL, lease_expires_at = NULL,
                         updated_at = ?4
                     WHERE id = ?1 AND lease_owner = ?2 AND status = 'RUNNING'",
                    params![job_id, worker_id, status, now],
                )
                .context("failed to complete job")?;
            Ok(n > 0)
        })
    }

    /// Record worker liveness for a job.
    pub fn heartbeat(&self, job_id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.ledger.with_conn(|conn| {
            conn.execute(
                "UPDATE bot_jobs SET last_heartbeat_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![job_id, now],
            )
            .context("failed to heartbeat job")?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Sweeps
    // -------------------------------------------------------------------------

    /// Mark RUNNING jobs whose heartbeat (or start, when no heartbeat was
    /// ever recorded) is older than `threshold_minutes` as TIMEOUT.
    pub fn timeout_stale(&self, threshold_minutes: i64) -> Result<usize> {
        let now = self.clock.now_ms();
        let cutoff = now - threshold_minutes * 60_000;

        let n = self.ledger.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE bot_jobs
                     SET status = 'TIMEOUT', lease_owner = NULL, lease_expires_at = NULL,
                         updated_at = ?2
                     WHERE status = 'RUNNING' AND (
                         (last_heartbeat_at IS NOT NULL AND last_heartbeat_at < ?1)
                         OR (last_heartbeat_at IS NULL AND started_at IS NOT NULL
                             AND started_at < ?1))",
                    params![cutoff, now],
                )
                .context("failed to time out stale jobs")?;
            Ok(n)
        })?;

        if n > 0 {
            warn!(count = n, threshold_minutes, "stale jobs marked TIMEOUT");
        }
        Ok(n)
    }

    /// Requeue TIMEOUT jobs that still have attempts left; fail the rest.
    pub fn requeue_timed_out(&self, max_attempts: i64) -> Result<usize> {
        let now = self.clock.now_ms();
        self.ledger.with_conn(|conn| {
            let requeued = conn
                .execute(
                    "UPDATE bot_jobs SET status = 'QUEUED', updated_at = ?2
                     WHERE status = 'TIMEOUT' AND attempts < ?1",
                    params![max_attempts, now],
                )
                .context("failed to requeue timed-out jobs")?;
            let failed = conn
                .execute(
                    "UPDATE bot_jobs SET status = 'FAILED', updated_at = ?2
                     WHERE status = 'TIMEOUT' AND attempts >= ?1",
                    params![max_attempts, now],
                )
                .context("failed to fail exhausted jobs")?;
            if failed > 0 {
                info!(failed, "jobs exhausted their attempts");
            }
            Ok(requeued)
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.ledger.with_conn(|conn| {
            conn.query_row(
                "SELECT id, bot_id, job_type, status, priority, lease_owner,
                        lease_expires_at, last_heartbeat_at, started_at, attempts,
                        payload, created_at
                 FROM bot_jobs WHERE id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()
            .context("failed to read job")
        })
    }

    /// Payloads of recently completed backtest jobs (newest first). The
    /// adaptive-weights rebalance consumes these as performance samples.
    pub fn completed_backtest_payloads(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        self.ledger.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT payload FROM bot_jobs
                     WHERE job_type = ?1 AND status = 'DONE' AND payload IS NOT NULL
                     ORDER BY updated_at DESC, id DESC LIMIT ?2",
                )
                .context("failed to prepare backtest payload query")?;
            let rows = stmt
                .query_map(params![JOB_TYPE_BACKTEST, limit as i64], |row| {
                    row.get::<_, String>(0)
                })
                .context("failed to query backtest payloads")?;
            let mut out = Vec::new();
            for row in rows {
                let raw = row.context("failed to read payload row")?;
                if let Ok(value) = serde_json::from_str(&raw) {
                    out.push(value);
                }
            }
            Ok(out)
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.ledger.with_conn(|conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn
                .prepare_cached("SELECT status, COUNT(*) FROM bot_jobs GROUP BY status")
                .context("failed to prepare stats query")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .context("failed to query stats")?;
            for row in rows {
                let (status, count) = row.context("failed to read stats row")?;
                match status.as_str() {
                    "QUEUED" => stats.queued = count,
                    "RUNNING" => stats.running = count,
                    "TIMEOUT" => stats.timeout = count,
                    "DONE" => stats.done = count,
                    "FAILED" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get(3)?;
    let payload: Option<String> = row.get(10)?;
    Ok(JobRecord {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        job_type: row.get(2)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        priority: row.get(4)?,
        lease_owner: row.get(5)?,
        lease_expires_at: row.get(6)?,
        last_heartbeat_at: row.get(7)?,
        started_at: row.get(8)?,
        attempts: row.get(9)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: row.get(11)?,
    })
}
