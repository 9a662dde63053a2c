// =============================================================================
// Background jobs: leased queue + worker pool
// =============================================================================

pub mod queue;
pub mod worker;

pub use queue::{JobQueue, JobRecord, QueueStats};
pub use worker::{run_sweep_loop, run_worker_loop, JobHandler};
