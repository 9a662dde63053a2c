// =============================================================================
// Source Governor — autonomous enable/disable with hysteresis
// =============================================================================
//
// Each (bot, source) pair holds one of {enabled, disabled, probation}.
//
//   enabled   -> disabled   weight pinned at the floor for N cycles, the
//                           provider is offline, or performance is deeply
//                           negative across enough backtests
//   disabled  -> probation  cooldown expired
//   probation -> enabled    performance recovered (>= 0) after the
//                           probation window
//   probation -> disabled   probation window elapsed without recovery
//
// Guardrail: a bot never drops below MIN_ENABLED_SOURCES enabled sources.
// Blocked disables are logged exactly once per evaluation cycle.  Every
// transition lands in the audit log.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::ledger::Ledger;
use crate::types::SourceStatus;

/// Never govern a bot below this many enabled sources.
pub const MIN_ENABLED_SOURCES: usize = 2;
/// Weight-floor cycles before a disable fires.
const FLOOR_CYCLES_TO_DISABLE: u32 = 3;
/// Performance below this disables, given enough evidence.
const PERF_DISABLE_THRESHOLD: f64 = -20.0;
/// Backtests required before the performance rule applies.
const MIN_BACKTESTS_FOR_PERF: u32 = 5;

/// Per-(bot, source) governed state.
#[derive(Debug, Clone, Serialize)]
pub struct SourceState {
    pub status: SourceStatus,
    pub disabled_at: Option<i64>,
    pub disabled_until: Option<i64>,
    pub probation_started_at: Option<i64>,
    pub performance_score: f64,
    pub consecutive_cycles_at_floor: u32,
}

impl SourceState {
    fn enabled() -> Self {
        Self {
            status: SourceStatus::Enabled,
            disabled_at: None,
            disabled_until: None,
            probation_started_at: None,
            performance_score: 0.0,
            consecutive_cycles_at_floor: 0,
        }
    }
}

/// One source's observations for a governance cycle.
#[derive(Debug, Clone)]
pub struct CycleInput {
    pub source_id: String,
    /// Current fusion weight for the source.
    pub weight: f64,
    /// Floor the adaptive-weights projection used.
    pub weight_floor: f64,
    pub provider_offline: bool,
    pub performance: f64,
    pub backtest_count: u32,
}

/// A transition the governor performed this cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub source_id: String,
    pub from: SourceStatus,
    pub to: SourceStatus,
    pub reason: String,
}

/// Governs source enablement per bot (key `"global"` for the default set).
pub struct SourceGovernor {
    clock: SharedClock,
    ledger: Ledger,
    cooldown_ms: i64,
    probation_ms: i64,
    states: RwLock<HashMap<String, HashMap<String, SourceState>>>,
}

impl SourceGovernor {
    pub fn new(clock: SharedClock, ledger: Ledger) -> Arc<Self> {
        Arc::new(Self {
            clock,
            ledger,
            cooldown_ms: 6 * 3_600_000,
            probation_ms: 2 * 3_600_000,
            states: RwLock::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn with_windows(clock: SharedClock, ledger: Ledger, cooldown_ms: i64, probation_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            clock,
            ledger,
            cooldown_ms,
            probation_ms,
            states: RwLock::new(HashMap::new()),
        })
    }

    /// Snapshot of a bot's source states.
    pub fn states_for(&self, bot_id: &str) -> HashMap<String, SourceState> {
        self.states.read().get(bot_id).cloned().unwrap_or_default()
    }

    /// Run one governance cycle for a bot and return the transitions made.
    pub fn evaluate_cycle(&self, bot_id: &str, inputs: &[CycleInput]) -> Vec<Transition> {
        let now = self.clock.now_ms();
        let mut transitions: Vec<Transition> = Vec::new();
        let mut blocked: Vec<String> = Vec::new();

        let mut all_states = self.states.write();
        let states = all_states.entry(bot_id.to_string()).or_default();

        for input in inputs {
            states
                .entry(input.source_id.clone())
                .or_insert_with(SourceState::enabled);
        }

        // Phase 1: disabled -> probation on cooldown expiry, probation
        // resolution. These never reduce the enabled count.
        for input in inputs {
            let Some(state) = states.get_mut(&input.source_id) else {
                continue;
            };
            state.performance_score = input.performance;

            match state.status {
                SourceStatus::Disabled => {
                    if state.disabled_until.is_some_and(|until| now >= until) {
                        state.status = SourceStatus::Probation;
                        state.probation_started_at = Some(now);
                        transitions.push(Transition {
                            source_id: input.source_id.clone(),
                            from: SourceStatus::Disabled,
                            to: SourceStatus::Probation,
                            reason: "cooldown expired".to_string(),
                        });
                    }
                }
                SourceStatus::Probation => {
                    let elapsed = state
                        .probation_started_at
                        .is_some_and(|start| now - start >= self.probation_ms);
                    if elapsed {
                        if input.performance >= 0.0 {
                            state.status = SourceStatus::Enabled;
                            state.probation_started_at = None;
                            state.disabled_at = None;
                            state.disabled_until = None;
                            state.consecutive_cycles_at_floor = 0;
                            transitions.push(Transition {
                                source_id: input.source_id.clone(),
                                from: SourceStatus::Probation,
                                to: SourceStatus::Enabled,
                                reason: format!("probation passed (perf {:.2})", input.performance),
                            });
                        } else {
                            state.status = SourceStatus::Disabled;
                            state.disabled_at = Some(now);
                            state.disabled_until = Some(now + self.cooldown_ms);
                            state.probation_started_at = None;
                            transitions.push(Transition {
                                source_id: input.source_id.clone(),
                                from: SourceStatus::Probation,
                                to: SourceStatus::Disabled,
                                reason: format!("probation failed (perf {:.2})", input.performance),
                            });
                        }
                    }
                }
                SourceStatus::Enabled => {}
            }
        }

        // Phase 2: enabled -> disabled, guarded by the minimum-enabled
        // floor.
        for input in inputs {
            let enabled_count = states
                .values()
                .filter(|s| s.status == SourceStatus::Enabled)
                .count();

            let Some(state) = states.get_mut(&input.source_id) else {
                continue;
            };
            if state.status != SourceStatus::Enabled {
                continue;
            }

            // Track floor-pinned cycles regardless of outcome.
            if input.weight <= input.weight_floor + 1e-9 {
                state.consecutive_cycles_at_floor += 1;
            } else {
                state.consecutive_cycles_at_floor = 0;
            }

            let reason = if input.provider_offline {
                Some("provider offline".to_string())
            } else if state.consecutive_cycles_at_floor >= FLOOR_CYCLES_TO_DISABLE {
                Some(format!(
                    "weight at floor for {} cycles",
                    state.consecutive_cycles_at_floor
                ))
            } else if input.performance < PERF_DISABLE_THRESHOLD
                && input.backtest_count >= MIN_BACKTESTS_FOR_PERF
            {
                Some(format!(
                    "performance {:.2} over {} backtests",
                    input.performance, input.backtest_count
                ))
            } else {
                None
            };

            let Some(reason) = reason else { continue };

            if enabled_count <= MIN_ENABLED_SOURCES {
                blocked.push(input.source_id.clone());
                continue;
            }

            state.status = SourceStatus::Disabled;
            state.disabled_at = Some(now);
            state.disabled_until = Some(now + self.cooldown_ms);
            state.consecutive_cycles_at_floor = 0;
            transitions.push(Transition {
                source_id: input.source_id.clone(),
                from: SourceStatus::Enabled,
                to: SourceStatus::Disabled,
                reason,
            });
        }

        drop(all_states);

        // Exactly one log line per cycle with blocked disables.
        if !blocked.is_empty() {
            warn!(
                bot_id,
                blocked = ?blocked,
                min_enabled = MIN_ENABLED_SOURCES,
                "disable blocked by minimum-enabled guardrail"
            );
            let detail = serde_json::json!({ "blocked": blocked });
            if let Err(e) = self.ledger.audit(
                "SOURCE_DISABLE_BLOCKED",
                Some(bot_id),
                None,
                Some(&detail),
                now,
            ) {
                warn!(error = %e, "failed to audit blocked disable");
            }
        }

        for t in &transitions {
            info!(
                bot_id,
                source = %t.source_id,
                from = %t.from,
                to = %t.to,
                reason = %t.reason,
                "source transition"
            );
            let detail = serde_json::json!({
                "source": t.source_id,
                "from": t.from,
                "to": t.to,
                "reason": t.reason,
            });
            if let Err(e) =
                self.ledger
                    .audit("SOURCE_TRANSITION", Some(bot_id), None, Some(&detail), now)
            {
                warn!(error = %e, "failed to audit source transition");
            }
        }

        transitions
    }
}
