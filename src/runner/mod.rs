// =============================================================================
// Paper runner: indicators, session rules, archetypes, engine, service
// =============================================================================

pub mod archetype;
pub mod engine;
pub mod indicators;
pub mod service;
pub mod session;
pub mod thresholds;

pub use archetype::Archetype;
pub use engine::{LivePnlUpdate, PaperRunner, RunnerContext, RunnerSettings};
pub use service::RunnerService;
pub use session::evaluate_session;
pub use thresholds::{derive_thresholds, BotThresholds, ThresholdCache};
