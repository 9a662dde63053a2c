// =============================================================================
// Central Application State — Meridian Control Plane
// =============================================================================
//
// The single composition of every subsystem.  All background tasks hold
// Arc references to their own services; AppState ties them together and
// builds the unified snapshot served over REST and pushed over WebSocket.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Subsystems manage their own interior mutability behind Arc.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::cache::BarCache;
use crate::clock::SharedClock;
use crate::ensemble::Ensemble;
use crate::jobs::{JobQueue, QueueStats};
use crate::ledger::{AuditEvent, Ledger};
use crate::lifecycle::{BlownAccountRecovery, MetricsAggregator};
use crate::market_data::router::{DataSource, LiveDataRouter};
use crate::market_data::tick_ingestor::{IngestMetrics, TickIngestor};
use crate::price_authority::{Mark, PriceAuthority};
use crate::runner::{LivePnlUpdate, RunnerService};
use crate::runtime_config::RuntimeConfig;
use crate::signals::SourceGovernor;

/// Audit rows included in a snapshot.
const SNAPSHOT_AUDIT_ROWS: usize = 50;

/// Central state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful mutation; the WebSocket feed pushes on change.
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub clock: SharedClock,
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub bar_cache: BarCache,
    pub router: Arc<LiveDataRouter>,
    pub ingestor: Arc<TickIngestor>,
    pub authority: Arc<PriceAuthority>,

    pub ledger: Ledger,
    pub queue: JobQueue,
    pub runner_service: Arc<RunnerService>,
    pub ensemble: Arc<Ensemble>,
    pub governor: Arc<SourceGovernor>,
    pub metrics: MetricsAggregator,
    pub recovery: BlownAccountRecovery,

    /// Fan-out channel of live P&L payloads (runners publish, WS forwards).
    pub live_updates_tx: broadcast::Sender<LivePnlUpdate>,
    /// Latest payload per bot for snapshot assembly.
    pub latest_updates: RwLock<HashMap<String, LivePnlUpdate>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Live update fan-in ──────────────────────────────────────────────

    /// Record a runner's latest payload and bump the version.
    pub fn record_live_update(&self, update: LivePnlUpdate) {
        self.latest_updates
            .write()
            .insert(update.bot_id.clone(), update);
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Full serialisable state for `GET /api/v1/state` and the WS feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = self.clock.now();
        let config = self.runtime_config.read();

        let marks: HashMap<String, Mark> = config
            .symbols
            .iter()
            .map(|s| (s.clone(), self.authority.get_mark(s, "1m")))
            .collect();

        let runners = self.latest_updates.read().values().cloned().collect();

        let queue_stats = self.queue.stats().unwrap_or_default();
        let recent_audit = self
            .ledger
            .recent_audit(SNAPSHOT_AUDIT_ROWS)
            .unwrap_or_default();

        let source_states: HashMap<String, HashMap<String, crate::signals::governor::SourceState>> =
            self.runner_service
                .active_bots()
                .into_iter()
                .map(|bot_id| {
                    let states = self.governor.states_for(&bot_id);
                    (bot_id, states)
                })
                .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            data_source: self.router.source_state(),
            autonomy_halted: self.authority.should_halt_autonomy(),
            symbols: config.symbols.clone(),
            marks,
            active_bots: self.runner_service.active_bots(),
            runners,
            warm_bars_total: self.bar_cache.warm().total_bars(),
            queue: queue_stats,
            ingest: self.ingestor.metrics(),
            source_states,
            recent_audit,
        }
    }
}

/// Full control-plane snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub data_source: DataSource,
    pub autonomy_halted: bool,
    pub symbols: Vec<String>,
    pub marks: HashMap<String, Mark>,
    pub active_bots: Vec<String>,
    pub runners: Vec<LivePnlUpdate>,
    pub warm_bars_total: usize,
    pub queue: QueueStats,
    pub ingest: IngestMetrics,
    pub source_states: HashMap<String, HashMap<String, crate::signals::governor::SourceState>>,
    pub recent_audit: Vec<AuditEvent>,
}
