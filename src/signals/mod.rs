// =============================================================================
// Signal plane: fusion, adaptive weights, and source governance
// =============================================================================

pub mod adaptive_weights;
pub mod fusion;
pub mod governor;

pub use adaptive_weights::{AdaptiveWeights, BacktestSample, Regime, WeightSet};
pub use fusion::{fuse, FusionResult, SourceSignal};
pub use governor::{CycleInput, SourceGovernor, MIN_ENABLED_SOURCES};
