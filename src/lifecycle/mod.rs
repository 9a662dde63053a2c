// =============================================================================
// Lifecycle governance: graduation gates, metrics, blown-account recovery
// =============================================================================

pub mod gates;
pub mod metrics;
pub mod recovery;

pub use gates::{check_graduation, GraduationCheck, MetricsInput};
pub use metrics::{compute_metrics, BotMetrics, MetricsAggregator};
pub use recovery::{BlownAccountRecovery, BlownOutcome};
