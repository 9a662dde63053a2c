// =============================================================================
// Tiered market-data cache: warm (memory) -> cold (SQLite) -> remote (API)
// =============================================================================

pub mod cold_store;
pub mod facade;
pub mod hydrator;
pub mod warm_cache;

pub use cold_store::ColdStore;
pub use facade::{BarCache, BarFetchOpts};
pub use hydrator::{HydratorError, RemoteHydrator};
pub use warm_cache::WarmCache;
