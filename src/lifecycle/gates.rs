// =============================================================================
// Graduation Gates — deterministic stage-promotion checks
// =============================================================================
//
// A pure function over a metrics snapshot.  Same input, same result,
// bit for bit: no clocks, no I/O, no randomness.  Promotion requires every
// gate for the bot's current stage to pass.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::BotStage;

/// Snapshot of everything the gates look at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsInput {
    pub stage: BotStage,
    pub closed_trades: i64,
    /// Win rate in [0, 1].
    pub win_rate: f64,
    /// Max drawdown percent (positive number).
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    /// Average $ per trade.
    pub expectancy_usd: f64,
    pub sharpe: f64,
    pub total_pnl: f64,
    pub has_losers: bool,
    pub data_proof: bool,
    #[serde(default)]
    pub days_active: i64,
    #[serde(default)]
    pub walk_forward_passed: bool,
    #[serde(default)]
    pub overfit_ratio: f64,
    #[serde(default)]
    pub stress_test_passed: bool,
    #[serde(default)]
    pub human_approval: bool,
}

/// One evaluated gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub required: String,
    pub current: String,
    pub passed: bool,
    /// ">=" or "<=" (or "==" for boolean gates).
    pub direction: String,
}

/// Full graduation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraduationCheck {
    pub stage: BotStage,
    pub gates: Vec<GateResult>,
    pub all_passed: bool,
    pub blockers: Vec<String>,
}

/// Numeric thresholds per stage.
struct StageThresholds {
    min_trades: i64,
    min_win_rate: f64,
    max_drawdown_pct: f64,
    min_profit_factor: f64,
    min_expectancy_usd: f64,
    min_sharpe: f64,
}

fn thresholds_for(stage: BotStage) -> Option<StageThresholds> {
    match stage {
        BotStage::Trials => Some(StageThresholds {
            min_trades: 50,
            min_win_rate: 0.35,
            max_drawdown_pct: 20.0,
            min_profit_factor: 1.20,
            min_expectancy_usd: 10.0,
            min_sharpe: 0.5,
        }),
        BotStage::Paper => Some(StageThresholds {
            min_trades: 100,
            min_win_rate: 0.40,
            max_drawdown_pct: 15.0,
            min_profit_factor: 1.30,
            min_expectancy_usd: 15.0,
            min_sharpe: 0.7,
        }),
        BotStage::Shadow => Some(StageThresholds {
            min_trades: 200,
            min_win_rate: 0.45,
            max_drawdown_pct: 12.0,
            min_profit_factor: 1.40,
            min_expectancy_usd: 20.0,
            min_sharpe: 0.9,
        }),
        BotStage::Canary => Some(StageThresholds {
            min_trades: 300,
            min_win_rate: 0.48,
            max_drawdown_pct: 10.0,
            min_profit_factor: 1.50,
            min_expectancy_usd: 25.0,
            min_sharpe: 1.0,
        }),
        BotStage::Live => None,
    }
}

fn gate_ge(name: &str, required: f64, current: f64) -> GateResult {
    GateResult {
        name: name.to_string(),
        required: format!("{required}"),
        current: format!("{current}"),
        passed: current >= required,
        direction: ">=".to_string(),
    }
}

fn gate_le(name: &str, required: f64, current: f64) -> GateResult {
    GateResult {
        name: name.to_string(),
        required: format!("{required}"),
        current: format!("{current}"),
        passed: current <= required,
        direction: "<=".to_string(),
    }
}

fn gate_bool(name: &str, current: bool) -> GateResult {
    GateResult {
        name: name.to_string(),
        required: "true".to_string(),
        current: format!("{current}"),
        passed: current,
        direction: "==".to_string(),
    }
}

/// Evaluate every gate for the bot's current stage.
pub fn check_graduation(input: &MetricsInput) -> GraduationCheck {
    let Some(t) = thresholds_for(input.stage) else {
        // LIVE is terminal.
        return GraduationCheck {
            stage: input.stage,
            gates: Vec::new(),
            all_passed: false,
            blockers: vec!["stage is terminal".to_string()],
        };
    };

    let mut gates = vec![
        gate_ge("min_trades", t.min_trades as f64, input.closed_trades as f64),
        gate_ge("min_win_rate", t.min_win_rate, input.win_rate),
        gate_le("max_drawdown_pct", t.max_drawdown_pct, input.max_drawdown_pct),
        gate_ge("min_profit_factor", t.min_profit_factor, input.profit_factor),
        gate_ge("min_expectancy_usd", t.min_expectancy_usd, input.expectancy_usd),
        gate_ge("min_sharpe", t.min_sharpe, input.sharpe),
        gate_bool("has_losers", input.has_losers),
        gate_bool("data_proof", input.data_proof),
        gate_bool("profitable", input.total_pnl > 0.0),
    ];

    if input.stage >= BotStage::Paper {
        gates.push(gate_ge("min_days_active", 5.0, input.days_active as f64));
    }
    if input.stage >= BotStage::Shadow {
        gates.push(gate_bool("walk_forward_passed", input.walk_forward_passed));
        gates.push(gate_le("overfit_ratio", 2.5, input.overfit_ratio));
    }
    if input.stage >= BotStage::Canary {
        gates.push(gate_bool("stress_test_passed", input.stress_test_passed));
        gates.push(gate_bool("human_approval", input.human_approval));
    }

    let blockers: Vec<String> = gates
        .iter()
        .filter(|g| !g.passed)
        .map(|g| g.name.clone())
        .collect();

    GraduationCheck {
        stage: input.stage,
        all_passed: blockers.is_empty(),
        gates,
        blockers,
    }
}
