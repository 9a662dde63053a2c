// =============================================================================
// Shared types used across the Meridian control plane
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a paper trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// +1.0 for long, -1.0 for short. Used by every P&L computation.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage of a bot. Promotion is strictly forward through the
/// graduation gates; demotion jumps back to Trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStage {
    Trials,
    Paper,
    Shadow,
    Canary,
    Live,
}

impl BotStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trials => "TRIALS",
            Self::Paper => "PAPER",
            Self::Shadow => "SHADOW",
            Self::Canary => "CANARY",
            Self::Live => "LIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRIALS" => Some(Self::Trials),
            "PAPER" => Some(Self::Paper),
            "SHADOW" => Some(Self::Shadow),
            "CANARY" => Some(Self::Canary),
            "LIVE" => Some(Self::Live),
            _ => None,
        }
    }

    /// The stage a bot moves to when every graduation gate passes.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Trials => Some(Self::Paper),
            Self::Paper => Some(Self::Shadow),
            Self::Shadow => Some(Self::Canary),
            Self::Canary => Some(Self::Live),
            Self::Live => None,
        }
    }
}

impl std::fmt::Display for BotStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine of a bot instance (a runner assignment binding bot and
/// account).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Idle,
    Scanning,
    InTrade,
    Exiting,
    Maintenance,
    MarketClosed,
    DataFrozen,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::InTrade => "IN_TRADE",
            Self::Exiting => "EXITING",
            Self::Maintenance => "MAINTENANCE",
            Self::MarketClosed => "MARKET_CLOSED",
            Self::DataFrozen => "DATA_FROZEN",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "SCANNING" => Some(Self::Scanning),
            "IN_TRADE" => Some(Self::InTrade),
            "EXITING" => Some(Self::Exiting),
            "MAINTENANCE" => Some(Self::Maintenance),
            "MARKET_CLOSED" => Some(Self::MarketClosed),
            "DATA_FROZEN" => Some(Self::DataFrozen),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runner state reported in the live broadcast payload. A strict subset of
/// [`InstanceState`]: clients only ever see these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerState {
    Scanning,
    InTrade,
    DataFrozen,
    MarketClosed,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scanning => "SCANNING",
            Self::InTrade => "IN_TRADE",
            Self::DataFrozen => "DATA_FROZEN",
            Self::MarketClosed => "MARKET_CLOSED",
        };
        f.write_str(s)
    }
}

/// Coarse activity indicator for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    Scanning,
    InTrade,
    Maintenance,
    MarketClosed,
    Idle,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scanning => "SCANNING",
            Self::InTrade => "IN_TRADE",
            Self::Maintenance => "MAINTENANCE",
            Self::MarketClosed => "MARKET_CLOSED",
            Self::Idle => "IDLE",
        };
        f.write_str(s)
    }
}

/// Current phase of the CME trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Active,
    Maintenance,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Maintenance => "MAINTENANCE",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Status of a paper trade row in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a paper trade was closed. Stored as a string code in the ledger and
/// surfaced verbatim in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    Target,
    TimeStop,
    SessionEnd,
    AutoFlattenBeforeClose,
    OrphanReconcile,
    KillSwitch,
    AccountBlown,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "STOP_LOSS",
            Self::Target => "TARGET",
            Self::TimeStop => "TIME_STOP",
            Self::SessionEnd => "SESSION_END",
            Self::AutoFlattenBeforeClose => "AUTO_FLATTEN_BEFORE_CLOSE",
            Self::OrphanReconcile => "ORPHAN_RECONCILE",
            Self::KillSwitch => "KILL_SWITCH",
            Self::AccountBlown => "ACCOUNT_BLOWN",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOP_LOSS" => Some(Self::StopLoss),
            "TARGET" => Some(Self::Target),
            "TIME_STOP" => Some(Self::TimeStop),
            "SESSION_END" => Some(Self::SessionEnd),
            "AUTO_FLATTEN_BEFORE_CLOSE" => Some(Self::AutoFlattenBeforeClose),
            "ORPHAN_RECONCILE" => Some(Self::OrphanReconcile),
            "KILL_SWITCH" => Some(Self::KillSwitch),
            "ACCOUNT_BLOWN" => Some(Self::AccountBlown),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a background job in the lease queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Timeout,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Timeout => "TIMEOUT",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "TIMEOUT" => Some(Self::Timeout),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an account attempt. Exactly one attempt per account is Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Active,
    Blown,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blown => "BLOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "BLOWN" => Some(Self::Blown),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional bias emitted by a signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
    RiskOn,
    RiskOff,
}

impl Bias {
    /// Scalar score for the fusion aggregation.
    pub fn score(&self) -> f64 {
        match self {
            Self::Bullish | Self::RiskOn => 1.0,
            Self::Bearish | Self::RiskOff => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Neutral => "NEUTRAL",
            Self::RiskOn => "RISK_ON",
            Self::RiskOff => "RISK_OFF",
        };
        f.write_str(s)
    }
}

/// Enablement status of a signal source for a given bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Enabled,
    Disabled,
    Probation,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Probation => "probation",
        };
        f.write_str(s)
    }
}

/// Decision returned by an ensemble vote provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDecision {
    Buy,
    Sell,
    Hold,
    Abstain,
}

impl VoteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Abstain => "ABSTAIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            "ABSTAIN" => Some(Self::Abstain),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
