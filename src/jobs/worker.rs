// =============================================================================
// Worker pool — claims leased jobs and keeps them alive
// =============================================================================
//
// Each worker runs an independent claim loop: claim, execute under a
// heartbeat, complete.  Lease expiry is never checked by the worker itself;
// the sweep loop owns timeout detection and requeueing.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::queue::{JobQueue, JobRecord};

/// How often a busy worker renews its lease and heartbeat.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(15);
/// Idle workers poll for new jobs at this interval.
const IDLE_POLL: Duration = Duration::from_secs(2);
/// Timed-out jobs are retried until this many attempts.
const MAX_JOB_ATTEMPTS: i64 = 3;

/// Executes one claimed job. Implementations are the seams where evolution,
/// backtest, and recovery work plug in.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()>;
}

/// Run one worker until the process shuts down.
pub async fn run_worker_loop(
    worker_id: String,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    lease_secs: u64,
) {
    info!(worker_id = %worker_id, "worker started");

    loop {
        let job = match queue.claim(&worker_id, lease_secs, None) {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "claim failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        debug!(worker_id = %worker_id, job_id = %job.id, job_type = %job.job_type, "job claimed");
        let success = execute_with_heartbeat(&worker_id, &queue, &job, &*handler, lease_secs).await;

        match queue.complete(&job.id, &worker_id, success) {
            Ok(true) => {
                debug!(job_id = %job.id, success, "job completed");
            }
            Ok(false) => {
                // The sweep took the lease away mid-flight; its verdict wins.
                warn!(job_id = %job.id, "lease lost before completion");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record job completion");
            }
        }
    }
}

/// Execute the handler while renewing lease + heartbeat on a fixed cadence.
async fn execute_with_heartbeat(
    worker_id: &str,
    queue: &JobQueue,
    job: &JobRecord,
    handler: &dyn JobHandler,
    lease_secs: u64,
) -> bool {
    let work = handler.handle(job);
    tokio::pin!(work);

    let mut ticker = tokio::time::interval(HEARTBEAT_EVERY);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it.
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut work => {
                return match result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "job handler failed");
                        false
                    }
                };
            }
            _ = ticker.tick() => {
                if let Err(e) = queue.heartbeat(&job.id) {
                    warn!(job_id = %job.id, error = %e, "heartbeat failed");
                }
                if let Ok(false) = queue.renew(&job.id, worker_id, lease_secs) {
                    warn!(job_id = %job.id, "lease renewal rejected -- abandoning job");
                    return false;
                }
            }
        }
    }
}

/// Run the timeout sweep until shutdown: stale RUNNING jobs become TIMEOUT,
/// and timed-out jobs with attempts left are requeued.
pub async fn run_sweep_loop(queue: JobQueue, threshold_minutes: i64, every: Duration) {
    info!(threshold_minutes, "job timeout sweep started");
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;
        match queue.timeout_stale(threshold_minutes) {
            Ok(n) if n > 0 => {
                if let Err(e) = queue.requeue_timed_out(MAX_JOB_ATTEMPTS) {
                    error!(error = %e, "requeue of timed-out jobs failed");
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "timeout sweep failed"),
        }
    }
}
