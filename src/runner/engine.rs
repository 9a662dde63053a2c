// =============================================================================
// Paper Runner — per-bot trading state machine
// =============================================================================
//
// One runner per started bot.  Each closed bar moves through a strict
// sequence: append -> heartbeat -> warmup check -> freeze check -> session
// evaluation -> exit evaluation -> entry evaluation -> broadcast -> persist.
// A bar is fully processed before the next one is looked at.
//
// Hard rules enforced here:
//   - No entry is evaluated and no P&L leaves this module unless the mark
//     is FRESH (the Price Authority's verdict, the same one the UI sees).
//   - At most one OPEN trade per (bot, active attempt); start() reconciles
//     any extras it finds with ORPHAN_RECONCILE.
//   - The cross-bot duplicate guard blocks fingerprint-identical entries
//     within the same bar.
//   - Maintenance allows neither entries nor liquidation; positions ride.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::archetype::{entry_signal, Archetype, EntryContext};
use super::indicators::IndicatorSet;
use super::session::evaluate_session;
use super::thresholds::BotThresholds;
use crate::clock::SharedClock;
use crate::ledger::trades::PaperTradeRecord;
use crate::ledger::Ledger;
use crate::lifecycle::{BlownAccountRecovery, MetricsAggregator};
use crate::market_data::Bar;
use crate::price_authority::PriceAuthority;
use crate::runtime_config::{HolidayRule, InstrumentSpec};
use crate::types::{
    ActivityState, ExitReason, InstanceState, RunnerState, SessionState, TradeSide, TradeStatus,
};

/// Services every runner shares.
pub struct RunnerContext {
    pub clock: SharedClock,
    pub ledger: Ledger,
    pub authority: Arc<PriceAuthority>,
    pub metrics: MetricsAggregator,
    pub recovery: BlownAccountRecovery,
    pub broadcast_tx: broadcast::Sender<LivePnlUpdate>,
}

/// Static per-runner settings resolved at start.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub bar_buffer_cap: usize,
    pub warmup_bars: usize,
    pub stop_ticks: f64,
    pub target_ticks: f64,
    pub time_stop_minutes: i64,
    pub flatten_minutes: i64,
    pub auto_flatten: bool,
    pub fees_per_side: f64,
    pub holidays: Vec<HolidayRule>,
}

/// The live-P&L payload pushed to the UI. Numeric fields are null whenever
/// the mark is not fresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePnlUpdate {
    pub bot_id: String,
    pub unrealized_pnl: Option<f64>,
    pub current_price: Option<f64>,
    pub entry_price: Option<f64>,
    pub side: Option<TradeSide>,
    pub position_quantity: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub position_opened_at: Option<i64>,
    pub live_position_active: bool,
    pub mark_timestamp: Option<i64>,
    pub mark_fresh: bool,
    pub session_state: SessionState,
    pub is_sleeping: bool,
    pub runner_state: RunnerState,
    pub activity_state: ActivityState,
}

/// In-memory view of the runner's open trade. The ledger row is the
/// durable record; this mirrors it.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub trade_id: String,
    pub side: TradeSide,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_ts: i64,
    pub stop_price: f64,
    pub target_price: f64,
}

/// Fusion gate pushed in by the signal plane.
#[derive(Debug, Clone)]
pub struct FusionGate {
    pub trading_allowed: bool,
    pub size_multiplier: f64,
}

impl Default for FusionGate {
    fn default() -> Self {
        Self {
            trading_allowed: true,
            size_multiplier: 1.0,
        }
    }
}

/// Per-bot paper-trading state machine.
pub struct PaperRunner {
    ctx: Arc<RunnerContext>,
    settings: RunnerSettings,

    bot_id: String,
    symbol: String,
    archetype: Archetype,
    account_id: String,
    attempt_id: String,
    instrument: InstrumentSpec,
    thresholds: BotThresholds,

    bars: VecDeque<Bar>,
    indicators: IndicatorSet,
    open_position: Option<OpenPosition>,
    fusion: FusionGate,

    frozen: bool,
    session_state: SessionState,
    stopped: bool,
    /// Edge detector for entry-gate freshness audits.
    last_entry_gate_fresh: bool,
}

impl PaperRunner {
    /// Build a runner. Fails closed on an unknown archetype or missing
    /// instrument spec.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<RunnerContext>,
        settings: RunnerSettings,
        bot_id: String,
        symbol: String,
        archetype: &str,
        account_id: String,
        attempt_id: String,
        instrument: InstrumentSpec,
        thresholds: BotThresholds,
    ) -> Result<Self> {
        let Some(archetype) = Archetype::parse(archetype) else {
            bail!("unknown archetype '{archetype}' for bot {bot_id}: refusing to start");
        };

        Ok(Self {
            ctx,
            settings,
            bot_id,
            symbol,
            archetype,
            account_id,
            attempt_id,
            instrument,
            thresholds,
            bars: VecDeque::new(),
            indicators: IndicatorSet::new(),
            open_position: None,
            fusion: FusionGate::default(),
            frozen: false,
            session_state: SessionState::Closed,
            stopped: false,
            last_entry_gate_fresh: true,
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn open_position(&self) -> Option<&OpenPosition> {
        self.open_position.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // -------------------------------------------------------------------------
    // Start
    // -------------------------------------------------------------------------

    /// Hydrate from the ledger and bootstrap indicators from `bootstrap`
    /// bars (oldest first, typically the warm-cache tail).
    pub fn start(&mut self, bootstrap: Vec<Bar>) -> Result<()> {
        self.reconcile_open_trades()
            .context("orphan reconcile failed")?;

        for bar in &bootstrap {
            self.bars.push_back(*bar);
            self.indicators.on_bar(bar);
        }
        while self.bars.len() > self.settings.bar_buffer_cap {
            self.bars.pop_front();
        }

        let now = self.ctx.clock.now_ms();
        self.session_state = evaluate_session(self.ctx.clock.now(), &self.settings.holidays).state;
        self.ctx
            .ledger
            .set_instance_state(&self.bot_id, self.instance_state(), now)?;

        info!(
            bot_id = %self.bot_id,
            symbol = %self.symbol,
            archetype = %self.archetype,
            bootstrap = bootstrap.len(),
            position = self.open_position.is_some(),
            "runner started"
        );

        self.broadcast();
        Ok(())
    }

    /// Load OPEN trades for this bot+attempt; the newest survives as the
    /// runner's position, every older one closes flat as an orphan.
    fn reconcile_open_trades(&mut self) -> Result<()> {
        let open = self
            .ctx
            .ledger
            .open_trades_for_bot(&self.bot_id, &self.attempt_id)?;

        if open.len() > 1 {
            error!(
                bot_id = %self.bot_id,
                count = open.len(),
                "multiple OPEN trades found -- reconciling extras"
            );
            let now = self.ctx.clock.now_ms();
            for orphan in &open[1..] {
                self.ctx.ledger.close_trade(
                    &orphan.id,
                    orphan.entry_price,
                    now,
                    ExitReason::OrphanReconcile,
                    0.0,
                    0.0,
                    0.0,
                )?;
                self.ctx.ledger.audit(
                    "ORPHAN_RECONCILE",
                    Some(&self.bot_id),
                    Some(&self.symbol),
                    Some(&json!({ "trade_id": orphan.id, "kept": open[0].id })),
                    now,
                )?;
            }
        }

        if let Some(newest) = open.first() {
            self.open_position = Some(self.position_from_trade(newest));
        }
        Ok(())
    }

    fn position_from_trade(&self, trade: &PaperTradeRecord) -> OpenPosition {
        let tick = self.instrument.tick_size;
        let dir = trade.side.direction();
        OpenPosition {
            trade_id: trade.id.clone(),
            side: trade.side,
            qty: trade.qty,
            entry_price: trade.entry_price,
            entry_ts: trade.entry_ts,
            stop_price: trade.entry_price - dir * self.settings.stop_ticks * tick,
            target_price: trade.entry_price + dir * self.settings.target_ticks * tick,
        }
    }

    // -------------------------------------------------------------------------
    // External signals
    // -------------------------------------------------------------------------

    /// Router edge events: freeze on stale data, resume on recovery.
    pub fn set_frozen(&mut self, frozen: bool) {
        if self.frozen == frozen {
            return;
        }
        self.frozen = frozen;
        info!(bot_id = %self.bot_id, frozen, "data freeze state changed");
        self.broadcast();
    }

    /// Latest fusion verdict from the signal plane.
    pub fn set_fusion(&mut self, gate: FusionGate) {
        self.fusion = gate;
    }

    /// Stop the runner, flattening any open position with `reason`.
    pub fn stop(&mut self, reason: ExitReason) {
        if self.stopped {
            return;
        }
        if self.open_position.is_some() {
            if let Some(price) = self.last_close() {
                self.close_position(price, reason);
            }
        }
        self.stopped = true;
        let now = self.ctx.clock.now_ms();
        if let Err(e) = self
            .ctx
            .ledger
            .set_instance_state(&self.bot_id, InstanceState::Stopped, now)
        {
            warn!(bot_id = %self.bot_id, error = %e, "failed to persist stopped state");
        }
        info!(bot_id = %self.bot_id, reason = %reason, "runner stopped");
    }

    // -------------------------------------------------------------------------
    // Bar processing
    // -------------------------------------------------------------------------

    /// Process one closed bar, start to finish.
    pub fn on_bar(&mut self, bar: Bar) {
        if self.stopped {
            return;
        }

        // 1. Append with the hard cap.
        self.bars.push_back(bar);
        while self.bars.len() > self.settings.bar_buffer_cap {
            self.bars.pop_front();
        }

        // 2. Heartbeat.
        let now = self.ctx.clock.now_ms();
        if let Err(e) = self.ctx.ledger.touch_instance_heartbeat(&self.bot_id, now) {
            warn!(bot_id = %self.bot_id, error = %e, "heartbeat persist failed");
        }

        // 3. Session evaluation (also drives the VWAP/session reset).
        let snapshot = evaluate_session(self.ctx.clock.now(), &self.settings.holidays);
        let prior_session = self.session_state;
        self.session_state = snapshot.state;
        if prior_session == SessionState::Closed && snapshot.state == SessionState::Active {
            self.indicators.reset_session();
        }

        // 4. Indicators always advance, frozen or not.
        self.indicators.on_bar(&bar);

        // 5. Warmup gate.
        let in_warmup = self.bars.len() < self.settings.warmup_bars;

        // 6. Frozen: keep receiving, skip all execution.
        if self.frozen {
            self.persist_state_and_broadcast();
            return;
        }

        if !in_warmup {
            // 7. Exits first.
            if self.open_position.is_some() {
                self.evaluate_exits(&bar, &snapshot.minutes_until_close);
            }

            // 8. Entries when flat and the session allows it.
            if self.open_position.is_none() && self.session_state == SessionState::Active {
                self.evaluate_entry(&bar);
            }
        }

        // 9. Broadcast + persist.
        self.persist_state_and_broadcast();
    }

    fn persist_state_and_broadcast(&mut self) {
        let now = self.ctx.clock.now_ms();
        if let Err(e) = self
            .ctx
            .ledger
            .set_instance_state(&self.bot_id, self.instance_state(), now)
        {
            warn!(bot_id = %self.bot_id, error = %e, "instance state persist failed");
        }
        self.broadcast();
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    fn evaluate_exits(&mut self, bar: &Bar, minutes_until_close: &Option<i64>) {
        let Some(position) = self.open_position.clone() else {
            return;
        };

        match self.session_state {
            // Maintenance: no liquidation, positions ride through.
            SessionState::Maintenance => return,
            // Session over (weekly close or holiday): flatten now.
            SessionState::Closed => {
                self.close_position(bar.close, ExitReason::SessionEnd);
                return;
            }
            SessionState::Active => {}
        }

        let close = bar.close;
        let is_long = position.side == TradeSide::Buy;

        let stop_hit = if is_long {
            close <= position.stop_price
        } else {
            close >= position.stop_price
        };
        if stop_hit {
            self.close_position(close, ExitReason::StopLoss);
            return;
        }

        let target_hit = if is_long {
            close >= position.target_price
        } else {
            close <= position.target_price
        };
        if target_hit {
            self.close_position(close, ExitReason::Target);
            return;
        }

        let now = self.ctx.clock.now_ms();
        let held_minutes = (now - position.entry_ts) / 60_000;
        if held_minutes >= self.settings.time_stop_minutes {
            self.close_position(close, ExitReason::TimeStop);
            return;
        }

        if self.settings.auto_flatten {
            if let Some(minutes) = minutes_until_close {
                if *minutes <= self.settings.flatten_minutes {
                    self.close_position(close, ExitReason::AutoFlattenBeforeClose);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------------

    fn evaluate_entry(&mut self, bar: &Bar) {
        // Freshness gate: entry evaluation requires a FRESH mark, and the
        // gating decision is audited on the freshness edge.
        let mark = self.ctx.authority.get_mark(&self.symbol, "1m");
        if !mark.is_fresh() {
            if self.last_entry_gate_fresh {
                self.ctx
                    .authority
                    .persist_freshness_audit(&self.bot_id, &self.symbol, &mark, "entry_gate");
            }
            self.last_entry_gate_fresh = false;
            return;
        }
        self.last_entry_gate_fresh = true;

        if !self.fusion.trading_allowed {
            return;
        }

        // Indicator readiness.
        let (Some(rsi), Some(vwap), Some(atr), Some(ema9), Some(ema21), Some(momentum)) = (
            self.indicators.rsi14(),
            self.indicators.vwap(),
            self.indicators.atr14(),
            self.indicators.ema9(),
            self.indicators.ema21(),
            self.indicators.momentum(),
        ) else {
            return;
        };

        let ctx = EntryContext {
            close: bar.close,
            rsi,
            vwap,
            atr,
            ema9,
            ema21,
            momentum,
            high_of_session: self
                .indicators
                .high_of_session_before_bar()
                .unwrap_or(bar.high),
            low_of_session: self
                .indicators
                .low_of_session_before_bar()
                .unwrap_or(bar.low),
        };

        let Some(side) = entry_signal(self.archetype, &ctx, &self.thresholds) else {
            return;
        };

        let entry_price = bar.close;
        let now = self.ctx.clock.now_ms();

        // Cross-bot duplicate guard on (symbol, bar, price, side).
        match self.ctx.ledger.find_duplicate_open(
            &self.symbol,
            bar.ts_event,
            entry_price,
            side,
            &self.bot_id,
        ) {
            Ok(Some(other_bot)) => {
                warn!(
                    bot_id = %self.bot_id,
                    other_bot = %other_bot,
                    symbol = %self.symbol,
                    "duplicate trade blocked"
                );
                if let Err(e) = self.ctx.ledger.audit(
                    "ORDER_BLOCKED_RISK",
                    Some(&self.bot_id),
                    Some(&self.symbol),
                    Some(&json!({
                        "code": "DUPLICATE_TRADE_GUARDRAIL",
                        "conflicting_bot": other_bot,
                        "bar_ts": bar.ts_event,
                        "price": entry_price,
                        "side": side,
                    })),
                    now,
                ) {
                    warn!(error = %e, "failed to audit blocked order");
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(bot_id = %self.bot_id, error = %e, "duplicate guard query failed");
                return;
            }
        }

        let qty = (self.fusion.size_multiplier.max(0.0) * 1.0).round().max(1.0);
        let tick = self.instrument.tick_size;
        let dir = side.direction();

        let trade = PaperTradeRecord {
            id: Uuid::new_v4().to_string(),
            bot_id: self.bot_id.clone(),
            account_attempt_id: self.attempt_id.clone(),
            symbol: self.symbol.clone(),
            side,
            qty,
            entry_price,
            entry_ts: now,
            entry_bar_ts: bar.ts_event,
            exit_price: None,
            exit_ts: None,
            status: TradeStatus::Open,
            exit_reason: None,
            pnl: 0.0,
            fees: 0.0,
            slippage: 0.0,
        };

        if let Err(e) = self.ctx.ledger.insert_trade(&trade) {
            error!(bot_id = %self.bot_id, error = %e, "failed to persist entry");
            return;
        }

        self.open_position = Some(OpenPosition {
            trade_id: trade.id.clone(),
            side,
            qty,
            entry_price,
            entry_ts: now,
            stop_price: entry_price - dir * self.settings.stop_ticks * tick,
            target_price: entry_price + dir * self.settings.target_ticks * tick,
        });

        info!(
            bot_id = %self.bot_id,
            symbol = %self.symbol,
            side = %side,
            entry_price,
            qty,
            "position opened"
        );
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the open position at `price` with one tick of adverse
    /// slippage and per-side fees, then refresh metrics and re-check the
    /// blown-account predicate (side-effects deferred through the queue).
    fn close_position(&mut self, price: f64, reason: ExitReason) {
        let Some(position) = self.open_position.take() else {
            return;
        };

        let tick = self.instrument.tick_size;
        let dir = position.side.direction();
        let exit_price = price - dir * tick; // adverse fill
        let slippage = tick * self.instrument.point_value * position.qty;
        let pnl =
            (exit_price - position.entry_price) * dir * position.qty * self.instrument.point_value;
        let fees = self.settings.fees_per_side * 2.0 * position.qty;
        let now = self.ctx.clock.now_ms();

        match self.ctx.ledger.close_trade(
            &position.trade_id,
            exit_price,
            now,
            reason,
            pnl,
            fees,
            slippage,
        ) {
            Ok(true) => {
                info!(
                    bot_id = %self.bot_id,
                    trade_id = %position.trade_id,
                    reason = %reason,
                    exit_price,
                    pnl,
                    "position closed"
                );
            }
            Ok(false) => {
                warn!(trade_id = %position.trade_id, "close found no OPEN row");
            }
            Err(e) => {
                error!(trade_id = %position.trade_id, error = %e, "failed to persist close");
            }
        }

        if let Err(e) = self
            .ctx
            .metrics
            .recompute_and_cache(&self.bot_id, &self.attempt_id)
        {
            warn!(bot_id = %self.bot_id, error = %e, "metrics recompute failed");
        }

        // Blown predicate: flips the attempt and enqueues recovery; the
        // heavy side-effects run from the job queue, not here.
        match self.ctx.recovery.check_account(&self.account_id) {
            Ok(outcome) => {
                if matches!(
                    outcome,
                    crate::lifecycle::BlownOutcome::Blown { .. }
                ) {
                    warn!(bot_id = %self.bot_id, account = %self.account_id, "account blown on close");
                }
            }
            Err(e) => error!(account = %self.account_id, error = %e, "blown predicate failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------------

    fn last_close(&self) -> Option<f64> {
        self.bars.back().map(|b| b.close)
    }

    fn runner_state(&self, mark_fresh: bool) -> RunnerState {
        if self.frozen || !mark_fresh {
            return RunnerState::DataFrozen;
        }
        if self.session_state == SessionState::Closed {
            return RunnerState::MarketClosed;
        }
        if self.open_position.is_some() {
            RunnerState::InTrade
        } else {
            RunnerState::Scanning
        }
    }

    fn activity_state(&self) -> ActivityState {
        match self.session_state {
            SessionState::Maintenance => ActivityState::Maintenance,
            SessionState::Closed => ActivityState::MarketClosed,
            SessionState::Active => {
                if self.open_position.is_some() {
                    ActivityState::InTrade
                } else if self.bars.len() < self.settings.warmup_bars {
                    ActivityState::Idle
                } else {
                    ActivityState::Scanning
                }
            }
        }
    }

    fn instance_state(&self) -> InstanceState {
        if self.stopped {
            return InstanceState::Stopped;
        }
        if self.frozen {
            return InstanceState::DataFrozen;
        }
        match self.session_state {
            SessionState::Maintenance => InstanceState::Maintenance,
            SessionState::Closed => InstanceState::MarketClosed,
            SessionState::Active => {
                if self.open_position.is_some() {
                    InstanceState::InTrade
                } else {
                    InstanceState::Scanning
                }
            }
        }
    }

    /// Build and emit the live payload. The display path and the execution
    /// path share the same mark verdict.
    pub fn broadcast(&self) {
        let update = self.build_update();
        let _ = self.ctx.broadcast_tx.send(update);
    }

    pub fn build_update(&self) -> LivePnlUpdate {
        let mark = self.ctx.authority.get_mark(&self.symbol, "1m");
        let mark_fresh = mark.is_fresh();

        let (unrealized, current_price, mark_ts) = if mark_fresh {
            let unrealized = self.open_position.as_ref().and_then(|p| {
                self.ctx.authority.compute_pnl(
                    p.entry_price,
                    &mark,
                    p.side,
                    p.qty,
                    self.instrument.point_value,
                )
            });
            (unrealized, mark.price, mark.timestamp)
        } else {
            // Not fresh: every numeric live field is null.
            (None, None, None)
        };

        let position = self.open_position.as_ref().filter(|_| mark_fresh);

        LivePnlUpdate {
            bot_id: self.bot_id.clone(),
            unrealized_pnl: unrealized,
            current_price,
            entry_price: position.map(|p| p.entry_price),
            side: position.map(|p| p.side),
            position_quantity: position.map(|p| p.qty),
            stop_price: position.map(|p| p.stop_price),
            target_price: position.map(|p| p.target_price),
            position_opened_at: position.map(|p| p.entry_ts),
            live_position_active: self.open_position.is_some(),
            mark_timestamp: mark_ts,
            mark_fresh,
            session_state: self.session_state,
            is_sleeping: self.session_state != SessionState::Active,
            runner_state: self.runner_state(mark_fresh),
            activity_state: self.activity_state(),
        }
    }

}
