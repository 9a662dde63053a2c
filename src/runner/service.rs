// =============================================================================
// Runner Service — lifecycle of paper runners
// =============================================================================
//
// Owns one task per started bot.  Each task drains that bot's bar
// subscription and the router's freeze events; a bar is fully processed
// before the next is received.  Stopping delivers a reason through the
// task's control channel so pending bar callbacks observe the stopped
// state and no-op.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{error, info, warn};

use super::engine::{PaperRunner, RunnerContext, RunnerSettings};
use super::thresholds::ThresholdCache;
use crate::cache::WarmCache;
use crate::ledger::InstanceRecord;
use crate::market_data::router::{LiveDataRouter, RouterEvent};
use crate::market_data::BarKey;
use crate::runtime_config::RuntimeConfig;
use crate::types::{ExitReason, InstanceState};

struct RunnerHandle {
    symbol: String,
    control_tx: UnboundedSender<ExitReason>,
}

/// Starts, stops, and kills paper runners.
pub struct RunnerService {
    ctx: Arc<RunnerContext>,
    router: Arc<LiveDataRouter>,
    warm: Arc<WarmCache>,
    config: Arc<RwLock<RuntimeConfig>>,
    thresholds: ThresholdCache,
    runners: RwLock<HashMap<String, RunnerHandle>>,
}

impl RunnerService {
    pub fn new(
        ctx: Arc<RunnerContext>,
        router: Arc<LiveDataRouter>,
        warm: Arc<WarmCache>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            router,
            warm,
            config,
            thresholds: ThresholdCache::new(),
            runners: RwLock::new(HashMap::new()),
        })
    }

    /// Bots with a running task right now.
    pub fn active_bots(&self) -> Vec<String> {
        self.runners.read().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Start
    // -------------------------------------------------------------------------

    /// Start a runner for `bot_id`. Fail-closed on unknown bots, unknown
    /// archetypes, missing instruments, and accounts awaiting recovery.
    pub async fn start_bot(self: &Arc<Self>, bot_id: &str) -> Result<()> {
        if self.runners.read().contains_key(bot_id) {
            bail!("runner for {bot_id} already active");
        }

        let bot = self
            .ctx
            .ledger
            .get_bot(bot_id)?
            .with_context(|| format!("unknown bot {bot_id}"))?;
        let account_id = bot
            .account_id
            .clone()
            .with_context(|| format!("bot {bot_id} has no account"))?;

        // Blown-account guard.
        let now = self.ctx.clock.now_ms();
        if let Some(instance) = self.ctx.ledger.get_instance(bot_id)? {
            if instance.awaiting_recovery {
                self.ctx.ledger.audit(
                    "RUNNER_START_REFUSED",
                    Some(bot_id),
                    Some(&bot.symbol),
                    Some(&json!({ "reason": "awaiting account recovery" })),
                    now,
                )?;
                bail!("bot {bot_id} is awaiting account recovery");
            }
        } else {
            self.ctx.ledger.upsert_instance(&InstanceRecord {
                bot_id: bot_id.to_string(),
                account_id: account_id.clone(),
                state: InstanceState::Idle,
                last_heartbeat_ms: None,
                awaiting_recovery: false,
                ready_for_restart: false,
                updated_at: now,
            })?;
        }

        let attempt = self
            .ctx
            .ledger
            .active_attempt(&account_id)?
            .with_context(|| format!("account {account_id} has no active attempt"))?;

        let (settings, instrument, bootstrap_limit) = {
            let config = self.config.read();
            let instrument = config
                .instrument(&bot.symbol)
                .with_context(|| format!("no instrument spec for {}", bot.symbol))?;

            // Per-bot strategy config may override the protective distances.
            let stop_ticks = bot.strategy_config["stop_ticks"]
                .as_f64()
                .unwrap_or(config.stop_ticks);
            let target_ticks = bot.strategy_config["target_ticks"]
                .as_f64()
                .unwrap_or(config.target_ticks);

            (
                RunnerSettings {
                    bar_buffer_cap: config.bar_buffer_cap,
                    warmup_bars: config.warmup_bars,
                    stop_ticks,
                    target_ticks,
                    time_stop_minutes: config.time_stop_minutes,
                    flatten_minutes: config.flatten_minutes,
                    auto_flatten: config.auto_flatten,
                    fees_per_side: instrument.fee_per_side,
                    holidays: config.holidays.clone(),
                },
                instrument,
                config.bootstrap_bars,
            )
        };

        let mut runner = PaperRunner::new(
            Arc::clone(&self.ctx),
            settings,
            bot.id.clone(),
            bot.symbol.clone(),
            &bot.archetype,
            account_id,
            attempt.id.clone(),
            instrument,
            self.thresholds.for_bot(&bot.id),
        )?;

        let bootstrap = self.warm.get(&bot.symbol, bootstrap_limit).await;
        runner.start(bootstrap)?;

        // Wire the task: bars + freeze events + control.
        let mut bar_rx = self
            .router
            .subscribe_bars(BarKey::one_minute(bot.symbol.clone()));
        let mut event_rx = self.router.subscribe_events();
        let (control_tx, mut control_rx) = unbounded_channel::<ExitReason>();

        let service = Arc::clone(self);
        let task_bot_id = bot.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    reason = control_rx.recv() => {
                        let reason = reason.unwrap_or(ExitReason::Manual);
                        runner.stop(reason);
                        break;
                    }
                    bar = bar_rx.recv() => {
                        match bar {
                            Some(bar) => runner.on_bar(bar),
                            None => {
                                warn!(bot_id = %task_bot_id, "bar subscription closed");
                                runner.stop(ExitReason::Manual);
                                break;
                            }
                        }
                    }
                    event = event_rx.recv() => {
                        match event {
                            Ok(RouterEvent::DataFrozen { reason }) => {
                                info!(bot_id = %task_bot_id, reason = %reason, "runner frozen");
                                runner.set_frozen(true);
                            }
                            Ok(RouterEvent::DataResumed) => {
                                runner.set_frozen(false);
                            }
                            // Lagged/closed event stream is survivable.
                            Err(_) => {}
                        }
                    }
                }
            }
            service.runners.write().remove(&task_bot_id);
            info!(bot_id = %task_bot_id, "runner task ended");
        });

        self.runners.write().insert(
            bot.id.clone(),
            RunnerHandle {
                symbol: bot.symbol.clone(),
                control_tx,
            },
        );

        info!(bot_id = %bot.id, symbol = %bot.symbol, "runner launched");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stop
    // -------------------------------------------------------------------------

    /// Stop one runner. Unknown ids are a no-op (`false`).
    pub fn stop_bot(&self, bot_id: &str, reason: ExitReason) -> bool {
        let handle = self.runners.write().remove(bot_id);
        match handle {
            Some(handle) => {
                let _ = handle.control_tx.send(reason);
                true
            }
            None => false,
        }
    }

    /// Stop every runner attached to an account (recovery path).
    pub fn stop_for_account(&self, account_id: &str) -> usize {
        let bots = match self.ctx.ledger.bots_for_account(account_id) {
            Ok(bots) => bots,
            Err(e) => {
                error!(account_id, error = %e, "failed to list bots for account stop");
                return 0;
            }
        };
        let mut stopped = 0;
        for bot in bots {
            if self.stop_bot(&bot.id, ExitReason::AccountBlown) {
                stopped += 1;
            }
        }
        stopped
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Stop everything.  Phase one stops live runner tasks; phase two
    /// sweeps ledger instances still claiming activity (e.g. rows from a
    /// crashed process).  Exactly one audit event is emitted, success or
    /// partial failure alike.
    pub fn kill_switch(&self) -> Result<usize> {
        let active: Vec<String> = self.active_bots();
        let mut stopped = 0usize;
        let mut sweep_failures = 0usize;

        for bot_id in &active {
            if self.stop_bot(bot_id, ExitReason::KillSwitch) {
                stopped += 1;
            }
        }

        // Second phase: any instance the ledger still thinks is running.
        let now = self.ctx.clock.now_ms();
        let mut swept = 0usize;
        match self.ctx.ledger.instances_in_states(&[
            InstanceState::Scanning,
            InstanceState::InTrade,
            InstanceState::Exiting,
            InstanceState::Maintenance,
            InstanceState::DataFrozen,
            InstanceState::Idle,
        ]) {
            Ok(instances) => {
                for instance in instances {
                    match self.ctx.ledger.set_instance_state(
                        &instance.bot_id,
                        InstanceState::Stopped,
                        now,
                    ) {
                        Ok(()) => swept += 1,
                        Err(e) => {
                            sweep_failures += 1;
                            error!(bot_id = %instance.bot_id, error = %e, "kill sweep failed");
                        }
                    }
                }
            }
            Err(e) => {
                sweep_failures += 1;
                error!(error = %e, "kill sweep listing failed");
            }
        }

        // Single audit event regardless of outcome.
        if let Err(e) = self.ctx.ledger.audit(
            "KILL_SWITCH",
            None,
            None,
            Some(&json!({
                "runners_stopped": stopped,
                "instances_swept": swept,
                "failures": sweep_failures,
            })),
            now,
        ) {
            error!(error = %e, "failed to audit kill switch");
        }

        warn!(stopped, swept, sweep_failures, "kill switch engaged");
        Ok(stopped + swept)
    }

    /// Symbols with at least one active runner (for the snapshot).
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .runners
            .read()
            .values()
            .map(|h| h.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BarCache, ColdStore, RemoteHydrator};
    use crate::clock::manual::ManualClock;
    use crate::clock::Clock;
    use crate::jobs::queue::JobQueue;
    use crate::ledger::{BotRecord, Ledger};
    use crate::lifecycle::{BlownAccountRecovery, MetricsAggregator};
    use crate::market_data::stream::StreamEvent;
    use crate::market_data::tick_ingestor::{NullTickSink, TickIngestor};
    use crate::market_data::Bar;
    use crate::price_authority::PriceAuthority;
    use crate::types::BotStage;
    use chrono::{TimeZone, Utc};
    use chrono_tz::America::New_York;
    use tokio::sync::broadcast;

    struct Fixture {
        service: Arc<RunnerService>,
        router: Arc<LiveDataRouter>,
        ledger: Ledger,
    }

    fn fixture() -> Fixture {
        let start = New_York
            .with_ymd_and_hms(2025, 3, 3, 9, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::at(start);

        let cold = ColdStore::open_in_memory().unwrap();
        let hydrator = RemoteHydrator::new("http://127.0.0.1:1", None);
        let warm = crate::cache::WarmCache::new(
            clock.clone(),
            cold.clone(),
            hydrator,
            10_000,
            1_000,
            120,
        );
        let cache = BarCache::new(warm.clone(), cold.clone());
        let ingestor = Arc::new(TickIngestor::new(clock.clone(), Box::new(NullTickSink)));
        let router = LiveDataRouter::new(clock.clone(), cache, ingestor, 30);

        let ledger = Ledger::open_in_memory().unwrap();
        let authority = PriceAuthority::new(
            clock.clone(),
            router.clone(),
            warm.clone(),
            ledger.clone(),
            30,
            2,
            300,
        );
        let queue = JobQueue::new(ledger.clone(), clock.clone());
        let metrics = MetricsAggregator::new(ledger.clone(), clock.clone());
        let recovery = BlownAccountRecovery::new(ledger.clone(), queue, clock.clone());
        let (broadcast_tx, _) = broadcast::channel(256);

        let ctx = Arc::new(RunnerContext {
            clock: clock.clone(),
            ledger: ledger.clone(),
            authority,
            metrics,
            recovery,
            broadcast_tx,
        });

        // Seed cold bars so warm-cache bootstrap succeeds without remote.
        let now = clock.now_ms();
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar {
                ts_event: now - (5 - i) * 60_000,
                open: 5000.0,
                high: 5000.5,
                low: 4999.5,
                close: 5000.0,
                volume: 10,
            })
            .collect();
        cold.store("MES", "1m", &bars, now).unwrap();

        ledger.create_account("acct-1", 10_000.0, now).unwrap();

        let config = Arc::new(RwLock::new(RuntimeConfig::default()));
        let service = RunnerService::new(ctx, router.clone(), warm, config);

        Fixture {
            service,
            router,
            ledger,
        }
    }

    fn seed_bot(f: &Fixture, bot_id: &str, archetype: &str) {
        f.ledger
            .upsert_bot(&BotRecord {
                id: bot_id.to_string(),
                symbol: "MES".to_string(),
                stage: BotStage::Paper,
                archetype: archetype.to_string(),
                generation_id: None,
                account_id: Some("acct-1".to_string()),
                strategy_config: json!({}),
                cached_metrics: None,
                stage_locked_reason: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let f = fixture();
        seed_bot(&f, "bot-1", "MOMENTUM_SURGE");

        f.service.start_bot("bot-1").await.unwrap();
        assert_eq!(f.service.active_bots(), vec!["bot-1".to_string()]);
        assert_eq!(f.service.active_symbols(), vec!["MES".to_string()]);

        // Double-start is refused.
        assert!(f.service.start_bot("bot-1").await.is_err());

        assert!(f.service.stop_bot("bot-1", ExitReason::Manual));
        // Give the task a beat to drain the control channel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let instance = f.ledger.get_instance("bot-1").unwrap().unwrap();
        assert_eq!(instance.state, InstanceState::Stopped);
        assert!(!f.service.stop_bot("bot-1", ExitReason::Manual));
    }

    #[tokio::test]
    async fn unknown_bot_and_archetype_fail_closed() {
        let f = fixture();
        assert!(f.service.start_bot("ghost").await.is_err());

        seed_bot(&f, "bot-bad", "MARTINGALE");
        assert!(f.service.start_bot("bot-bad").await.is_err());
        assert!(f.service.active_bots().is_empty());
    }

    #[tokio::test]
    async fn awaiting_recovery_refuses_start() {
        let f = fixture();
        seed_bot(&f, "bot-1", "MOMENTUM_SURGE");
        f.ledger
            .upsert_instance(&InstanceRecord {
                bot_id: "bot-1".to_string(),
                account_id: "acct-1".to_string(),
                state: InstanceState::Stopped,
                last_heartbeat_ms: None,
                awaiting_recovery: true,
                ready_for_restart: false,
                updated_at: 0,
            })
            .unwrap();

        assert!(f.service.start_bot("bot-1").await.is_err());
        assert_eq!(f.ledger.audit_count("RUNNER_START_REFUSED").unwrap(), 1);
    }

    #[tokio::test]
    async fn runner_receives_routed_bars() {
        let f = fixture();
        seed_bot(&f, "bot-1", "MOMENTUM_SURGE");
        f.service.start_bot("bot-1").await.unwrap();

        // A routed bar lands in the runner task and bumps its heartbeat.
        f.router.handle_stream_event(StreamEvent::Bar {
            key: BarKey::one_minute("MES"),
            bar: Bar {
                ts_event: 600_000_000,
                open: 5000.0,
                high: 5001.0,
                low: 4999.0,
                close: 5000.5,
                volume: 20,
            },
            closed: true,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let instance = f.ledger.get_instance("bot-1").unwrap().unwrap();
        assert!(instance.last_heartbeat_ms.is_some());
    }

    #[tokio::test]
    async fn kill_switch_stops_and_sweeps_with_one_audit() {
        let f = fixture();
        for bot_id in ["bot-1", "bot-2"] {
            seed_bot(&f, bot_id, "MOMENTUM_SURGE");
            f.service.start_bot(bot_id).await.unwrap();
        }

        // A third instance from a crashed process lingers in the ledger.
        f.ledger
            .upsert_instance(&InstanceRecord {
                bot_id: "bot-zombie".to_string(),
                account_id: "acct-1".to_string(),
                state: InstanceState::InTrade,
                last_heartbeat_ms: None,
                awaiting_recovery: false,
                ready_for_restart: false,
                updated_at: 0,
            })
            .unwrap();

        let affected = f.service.kill_switch().unwrap();
        assert!(affected >= 3);
        assert!(f.service.active_bots().is_empty());
        assert_eq!(f.ledger.audit_count("KILL_SWITCH").unwrap(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let zombie = f.ledger.get_instance("bot-zombie").unwrap().unwrap();
        assert_eq!(zombie.state, InstanceState::Stopped);
    }
}
