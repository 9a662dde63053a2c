// =============================================================================
// Meridian Control Plane — Main Entry Point
// =============================================================================
//
// Composition root: every service is constructed here, wired together, and
// spawned as an explicit background task.  The process-wide state is
// enumerated in AppState, never implicit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod cache;
mod clock;
mod ensemble;
mod jobs;
mod ledger;
mod lifecycle;
mod market_data;
mod price_authority;
mod runner;
mod runtime_config;
mod signals;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::cache::{BarCache, ColdStore, RemoteHydrator, WarmCache};
use crate::clock::system_clock;
use crate::ensemble::{Ensemble, HttpVoteProvider, VoteProvider};
use crate::jobs::queue::{JOB_TYPE_BACKTEST, JOB_TYPE_EVOLUTION, JOB_TYPE_IMPROVING, JOB_TYPE_RECOVERY};
use crate::jobs::{JobHandler, JobQueue, JobRecord};
use crate::ledger::Ledger;
use crate::lifecycle::{BlownAccountRecovery, MetricsAggregator};
use crate::market_data::router::LiveDataRouter;
use crate::market_data::stream::{run_market_stream, StreamEvent};
use crate::market_data::tick_ingestor::{NullTickSink, TickIngestor};
use crate::price_authority::PriceAuthority;
use crate::runner::{RunnerContext, RunnerService};
use crate::runtime_config::RuntimeConfig;
use crate::signals::{AdaptiveWeights, SourceGovernor};

const CONFIG_PATH: &str = "meridian_config.json";
const WORKER_COUNT: usize = 4;

// =============================================================================
// Job handler — where claimed background jobs land
// =============================================================================

/// Routes claimed jobs to their subsystem.  Recovery runs inline; the
/// evolution-flavoured job types are executed by the external research
/// fleet and acknowledged here so the queue lifecycle stays observable.
struct ControlJobHandler {
    service: Arc<RunnerService>,
    recovery: BlownAccountRecovery,
    ledger: Ledger,
    clock: clock::SharedClock,
}

#[async_trait]
impl JobHandler for ControlJobHandler {
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()> {
        match job.job_type.as_str() {
            JOB_TYPE_RECOVERY => {
                let payload = job.payload.as_ref().context("recovery job missing payload")?;
                let account_id = payload["account_id"]
                    .as_str()
                    .context("recovery payload missing account_id")?;
                let consecutive = payload["consecutive"].as_i64().unwrap_or(0);

                let stopped = self.service.stop_for_account(account_id);
                info!(account_id, stopped, "runners stopped for blown account");
                self.recovery.run_recovery(account_id, consecutive)
            }
            JOB_TYPE_IMPROVING | JOB_TYPE_BACKTEST | JOB_TYPE_EVOLUTION => {
                // Executed out-of-process; acknowledge so the lease cycle
                // completes and dashboards see the hand-off.
                self.ledger.audit(
                    "JOB_DISPATCHED",
                    job.bot_id.as_deref(),
                    None,
                    Some(&serde_json::json!({ "job_id": job.id, "job_type": job.job_type })),
                    self.clock.now_ms(),
                )?;
                Ok(())
            }
            other => anyhow::bail!("unknown job type {other}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Control Plane — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    for symbol in &config.symbols {
        if config.instrument(symbol).is_none() {
            anyhow::bail!("no instrument spec configured for {symbol}: refusing to start");
        }
    }

    info!(symbols = ?config.symbols, holidays = config.holidays.len(), "configured instruments");

    let clock = system_clock();

    // ── 2. Storage ───────────────────────────────────────────────────────
    let cold = ColdStore::open(&config.cold_store_path)?;
    let ledger = Ledger::open(&config.ledger_path)?;

    let reset = ledger.reset_stale_activity_states(clock.now_ms())?;
    if reset > 0 {
        info!(count = reset, "stale instance states reset");
    }

    // ── 3. Market data tiers ─────────────────────────────────────────────
    let data_api_key = std::env::var("MERIDIAN_DATA_API_KEY").ok();
    let hydrator = RemoteHydrator::new(config.data_api_url.clone(), data_api_key);
    let warm = WarmCache::new(
        clock.clone(),
        cold.clone(),
        hydrator,
        config.max_bars_per_symbol,
        config.emergency_floor_bars,
        config.cache_stale_secs,
    );
    let bar_cache = BarCache::new(warm.clone(), cold.clone());

    let ingestor = Arc::new(TickIngestor::new(clock.clone(), Box::new(NullTickSink)));
    let router = LiveDataRouter::new(
        clock.clone(),
        bar_cache.clone(),
        Arc::clone(&ingestor),
        config.stale_tick_secs,
    );

    let report = warm.pre_warm(&config.symbols).await;
    info!(
        from_cold = report.from_cold,
        from_remote = report.from_remote,
        missing = ?report.missing,
        "cache pre-warm complete"
    );

    // ── 4. Authority, queue, lifecycle ───────────────────────────────────
    let authority = PriceAuthority::new(
        clock.clone(),
        Arc::clone(&router),
        warm.clone(),
        ledger.clone(),
        config.quote_fresh_secs,
        config.bar_fresh_multiplier,
        config.autonomy_halt_secs,
    );
    let queue = JobQueue::new(ledger.clone(), clock.clone());
    let metrics = MetricsAggregator::new(ledger.clone(), clock.clone());
    let recovery = BlownAccountRecovery::new(ledger.clone(), queue.clone(), clock.clone());

    // ── 5. Ensemble providers (fail-closed on required keys) ─────────────
    let mut providers: Vec<Arc<dyn VoteProvider>> = Vec::new();
    for pc in &config.providers {
        let api_key = pc.api_key_env.as_deref().and_then(|env| std::env::var(env).ok());
        if pc.required && pc.api_key_env.is_some() && api_key.is_none() {
            anyhow::bail!(
                "provider {} requires API key env {:?} which is unset",
                pc.name,
                pc.api_key_env
            );
        }
        providers.push(Arc::new(HttpVoteProvider::new(
            pc.name.clone(),
            pc.url.clone(),
            api_key,
            pc.base_weight,
            Duration::from_secs(config.provider_timeout_secs),
        )));
    }
    let ensemble = Arc::new(Ensemble::new(
        providers,
        Duration::from_secs(config.provider_timeout_secs),
        config.supermajority_required,
    ));

    // ── 6. Runner plane ──────────────────────────────────────────────────
    let (live_updates_tx, _) = broadcast::channel(1024);
    let runner_ctx = Arc::new(RunnerContext {
        clock: clock.clone(),
        ledger: ledger.clone(),
        authority: Arc::clone(&authority),
        metrics: metrics.clone(),
        recovery: recovery.clone(),
        broadcast_tx: live_updates_tx.clone(),
    });
    let shared_config = Arc::new(RwLock::new(config.clone()));
    let runner_service = RunnerService::new(
        Arc::clone(&runner_ctx),
        Arc::clone(&router),
        warm.clone(),
        Arc::clone(&shared_config),
    );

    let governor = SourceGovernor::new(clock.clone(), ledger.clone());
    let adaptive = AdaptiveWeights::new(clock.clone());

    // ── 7. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState {
        state_version: AtomicU64::new(1),
        ws_sequence_number: AtomicU64::new(0),
        clock: clock.clone(),
        runtime_config: Arc::clone(&shared_config),
        bar_cache: bar_cache.clone(),
        router: Arc::clone(&router),
        ingestor: Arc::clone(&ingestor),
        authority: Arc::clone(&authority),
        ledger: ledger.clone(),
        queue: queue.clone(),
        runner_service: Arc::clone(&runner_service),
        ensemble,
        governor,
        metrics: metrics.clone(),
        recovery: recovery.clone(),
        live_updates_tx: live_updates_tx.clone(),
        latest_updates: RwLock::new(Default::default()),
        start_time: std::time::Instant::now(),
    });

    // ── 8. Market stream with reconnect supervision ──────────────────────
    let (stream_tx, mut stream_rx) = tokio::sync::mpsc::unbounded_channel::<StreamEvent>();

    if config.stream_url.is_empty() {
        warn!("no stream URL configured -- running on cache polling only");
    } else {
        let url = config.stream_url.clone();
        let symbols = config.symbols.clone();
        let tx = stream_tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_market_stream(&url, &symbols, &tx).await {
                    error!(error = %e, "market stream error -- reconnecting in 5s");
                }
                let _ = tx.send(StreamEvent::Disconnected);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // Stream events drain into the router on their own task.
    {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            while let Some(event) = stream_rx.recv().await {
                router.handle_stream_event(event);
            }
        });
    }

    // ── 9. Polling fallback + staleness watch ────────────────────────────
    {
        let router = Arc::clone(&router);
        let symbols = config.symbols.clone();
        let interval_secs = config.bar_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                router.check_staleness();
                router.poll_cycle(&symbols).await;
            }
        });
    }

    // ── 10. Ingestor age-based flush ─────────────────────────────────────
    {
        let ingestor = Arc::clone(&ingestor);
        let clock = clock.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                ingestor.maybe_flush(clock.now_ms());
            }
        });
    }

    // ── 11. Worker pool + timeout sweep ──────────────────────────────────
    let handler: Arc<dyn JobHandler> = Arc::new(ControlJobHandler {
        service: Arc::clone(&runner_service),
        recovery: recovery.clone(),
        ledger: ledger.clone(),
        clock: clock.clone(),
    });
    for i in 0..WORKER_COUNT {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        let lease_secs = config.lease_secs;
        tokio::spawn(jobs::run_worker_loop(
            format!("worker-{i}"),
            queue,
            handler,
            lease_secs,
        ));
    }
    tokio::spawn(jobs::run_sweep_loop(
        queue.clone(),
        config.job_timeout_minutes,
        Duration::from_secs(60),
    ));

    // ── 12. Live update fan-in for snapshots ─────────────────────────────
    {
        let state = Arc::clone(&state);
        let mut rx = live_updates_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => state.record_live_update(update),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live update fan-in lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── 13. Signal-plane rebalance: adaptive weights -> governor ─────────
    {
        let state = Arc::clone(&state);
        let adaptive = Arc::clone(&adaptive);
        let queue = queue.clone();
        let source_ids: Vec<String> = config.providers.iter().map(|p| p.name.clone()).collect();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            loop {
                ticker.tick().await;
                if source_ids.len() < 2 {
                    continue;
                }
                if state.authority.should_halt_autonomy() {
                    continue;
                }

                let payloads = match queue.completed_backtest_payloads(500) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "failed to load backtest samples");
                        continue;
                    }
                };
                let samples: Vec<crate::signals::BacktestSample> = payloads
                    .iter()
                    .filter_map(|p| {
                        Some(crate::signals::BacktestSample {
                            source_id: p["source_id"].as_str()?.to_string(),
                            performance: p["performance"].as_f64()?,
                            win_rate: p["win_rate"].as_f64().unwrap_or(0.0),
                            completed_at_ms: p["completed_at"].as_i64()?,
                        })
                    })
                    .collect();

                for bot_id in state.runner_service.active_bots() {
                    let set = adaptive.weights_for(&bot_id, &samples, &source_ids);
                    let inputs: Vec<crate::signals::CycleInput> = source_ids
                        .iter()
                        .map(|id| {
                            let source_samples: Vec<_> =
                                samples.iter().filter(|s| &s.source_id == id).collect();
                            let performance = if source_samples.is_empty() {
                                0.0
                            } else {
                                source_samples.iter().map(|s| s.performance).sum::<f64>()
                                    / source_samples.len() as f64
                            };
                            crate::signals::CycleInput {
                                source_id: id.clone(),
                                weight: set.weights.get(id).copied().unwrap_or(0.0),
                                weight_floor: 0.05,
                                provider_offline: false,
                                performance,
                                backtest_count: source_samples.len() as u32,
                            }
                        })
                        .collect();
                    let transitions = state.governor.evaluate_cycle(&bot_id, &inputs);
                    if !transitions.is_empty() {
                        state.increment_version();
                    }
                }
            }
        });
    }

    // ── 14. Autonomy watch ───────────────────────────────────────────────
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            let mut was_halted = false;
            loop {
                ticker.tick().await;
                let halted = state.authority.should_halt_autonomy();
                if halted != was_halted {
                    if halted {
                        warn!("autonomy halted: no fresh marks within the configured window");
                    } else {
                        info!("autonomy resumed: fresh marks available");
                    }
                    was_halted = halted;
                    state.increment_version();
                }
            }
        });
    }

    // ── 15. API server ───────────────────────────────────────────────────
    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let state = Arc::clone(&state);
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running -- Ctrl+C to stop");

    // ── 16. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received -- stopping runners");

    for bot_id in runner_service.active_bots() {
        runner_service.stop_bot(&bot_id, crate::types::ExitReason::Manual);
    }

    if let Err(e) = shared_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian shut down complete");
    Ok(())
}
