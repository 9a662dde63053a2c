// =============================================================================
// Runtime Configuration — Hot-reloadable control-plane settings
// =============================================================================
//
// Central configuration hub for the Meridian control plane.  Every tunable
// parameter lives here so the plane can be reconfigured at runtime without a
// restart.  The CME holiday calendar and the instrument table are part of
// this asset so they update without code changes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "MES".to_string(),
        "MNQ".to_string(),
        "MYM".to_string(),
        "M2K".to_string(),
    ]
}

fn default_bar_interval_secs() -> u64 {
    60
}

fn default_quote_fresh_secs() -> u64 {
    30
}

fn default_bar_fresh_multiplier() -> u64 {
    2
}

fn default_autonomy_halt_secs() -> u64 {
    300
}

fn default_max_bars_per_symbol() -> usize {
    15_000
}

fn default_emergency_floor_bars() -> usize {
    5_000
}

fn default_cache_stale_secs() -> u64 {
    120
}

fn default_warmup_bars() -> usize {
    21
}

fn default_bar_buffer_cap() -> usize {
    100
}

fn default_bootstrap_bars() -> usize {
    50
}

fn default_time_stop_minutes() -> i64 {
    60
}

fn default_flatten_minutes() -> i64 {
    5
}

fn default_stop_ticks() -> f64 {
    20.0
}

fn default_target_ticks() -> f64 {
    40.0
}

fn default_lease_secs() -> u64 {
    120
}

fn default_job_timeout_minutes() -> i64 {
    10
}

fn default_stale_tick_secs() -> u64 {
    30
}

fn default_ledger_path() -> String {
    "meridian_ledger.db".to_string()
}

fn default_cold_store_path() -> String {
    "meridian_bars.db".to_string()
}

fn default_data_api_url() -> String {
    "https://data.meridian.internal/v1".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    15
}

fn default_instruments() -> HashMap<String, InstrumentSpec> {
    let mut m = HashMap::new();
    m.insert("MES".to_string(), InstrumentSpec::new(0.25, 5.0, 0.62));
    m.insert("MNQ".to_string(), InstrumentSpec::new(0.25, 2.0, 0.62));
    m.insert("MYM".to_string(), InstrumentSpec::new(1.0, 0.5, 0.62));
    m.insert("M2K".to_string(), InstrumentSpec::new(0.1, 5.0, 0.62));
    m
}

// =============================================================================
// Instrument table
// =============================================================================

/// Contract specification for one futures instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Minimum price increment.
    pub tick_size: f64,
    /// Dollar value of a one-point move per contract.
    pub point_value: f64,
    /// Commission + exchange fees charged per side, per contract.
    pub fee_per_side: f64,
}

impl InstrumentSpec {
    pub fn new(tick_size: f64, point_value: f64, fee_per_side: f64) -> Self {
        Self {
            tick_size,
            point_value,
            fee_per_side,
        }
    }

    /// Dollar value of a single tick per contract.
    pub fn tick_value(&self) -> f64 {
        self.tick_size * self.point_value
    }
}

// =============================================================================
// Holiday calendar
// =============================================================================

/// How the CME calendar treats a given date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HolidayKind {
    /// No trading at all, including no evening session that day.
    FullDayClosure,
    /// Day session closed; the evening session opens at 18:00 ET as usual.
    Partial,
    /// Session ends early at 13:00 ET.
    EarlyClose,
}

/// One dated entry in the holiday calendar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HolidayRule {
    pub date: NaiveDate,
    pub kind: HolidayKind,
}

// =============================================================================
// Vote providers
// =============================================================================

/// Configuration for one ensemble vote provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    /// Env var that holds the API key. Fail-closed at startup when the
    /// provider is required and the variable is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_base_weight")]
    pub base_weight: f64,
    #[serde(default)]
    pub required: bool,
}

fn default_provider_base_weight() -> f64 {
    1.0
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian control plane.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Symbols & instruments ----------------------------------------------
    /// Symbols the plane watches and paper-trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Contract specs keyed by symbol.
    #[serde(default = "default_instruments")]
    pub instruments: HashMap<String, InstrumentSpec>,

    /// Base bar interval in seconds (1m bars).
    #[serde(default = "default_bar_interval_secs")]
    pub bar_interval_secs: u64,

    // --- Freshness ----------------------------------------------------------
    /// Quotes older than this are STALE.
    #[serde(default = "default_quote_fresh_secs")]
    pub quote_fresh_secs: u64,

    /// Bars are FRESH within `multiplier * bar_interval_secs` of their close.
    #[serde(default = "default_bar_fresh_multiplier")]
    pub bar_fresh_multiplier: u64,

    /// No fresh data for this long halts autonomous actions entirely.
    #[serde(default = "default_autonomy_halt_secs")]
    pub autonomy_halt_secs: u64,

    /// Streaming source is considered stale (fall back to polling) after
    /// this many seconds without a tick.
    #[serde(default = "default_stale_tick_secs")]
    pub stale_tick_secs: u64,

    // --- Warm cache ---------------------------------------------------------
    /// Hard cap on in-memory bars per symbol.
    #[serde(default = "default_max_bars_per_symbol")]
    pub max_bars_per_symbol: usize,

    /// Emergency per-symbol floor applied under memory pressure.
    #[serde(default = "default_emergency_floor_bars")]
    pub emergency_floor_bars: usize,

    /// Cached bars older than this trigger a background refresh on read.
    #[serde(default = "default_cache_stale_secs")]
    pub cache_stale_secs: u64,

    // --- Runner -------------------------------------------------------------
    /// Bars required before a runner leaves warmup.
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,

    /// Maximum bars retained in a runner's buffer.
    #[serde(default = "default_bar_buffer_cap")]
    pub bar_buffer_cap: usize,

    /// Bars pulled from the warm cache when a runner starts.
    #[serde(default = "default_bootstrap_bars")]
    pub bootstrap_bars: usize,

    /// Hard time stop for any open position, in minutes.
    #[serde(default = "default_time_stop_minutes")]
    pub time_stop_minutes: i64,

    /// Force-exit positions this many minutes before session close.
    #[serde(default = "default_flatten_minutes")]
    pub flatten_minutes: i64,

    /// Whether the pre-close auto-flatten is active.
    #[serde(default = "default_true")]
    pub auto_flatten: bool,

    /// Default protective stop distance, in ticks.
    #[serde(default = "default_stop_ticks")]
    pub stop_ticks: f64,

    /// Default profit target distance, in ticks.
    #[serde(default = "default_target_ticks")]
    pub target_ticks: f64,

    // --- Session calendar ---------------------------------------------------
    /// CME holiday table. Dates are exchange dates (America/New_York).
    #[serde(default)]
    pub holidays: Vec<HolidayRule>,

    // --- Job queue ----------------------------------------------------------
    /// Default lease duration handed to workers.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// RUNNING jobs with no heartbeat for this long are marked TIMEOUT.
    #[serde(default = "default_job_timeout_minutes")]
    pub job_timeout_minutes: i64,

    // --- Ensemble providers -------------------------------------------------
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Per-provider vote timeout.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Require a 2/3 supermajority before executing ensemble decisions.
    #[serde(default = "default_true")]
    pub supermajority_required: bool,

    // --- Storage & external endpoints ---------------------------------------
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    #[serde(default = "default_cold_store_path")]
    pub cold_store_path: String,

    /// Historical data API base URL.
    #[serde(default = "default_data_api_url")]
    pub data_api_url: String,

    /// Streaming feed WebSocket URL. Empty means "polling only".
    #[serde(default)]
    pub stream_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            instruments: default_instruments(),
            bar_interval_secs: default_bar_interval_secs(),
            quote_fresh_secs: default_quote_fresh_secs(),
            bar_fresh_multiplier: default_bar_fresh_multiplier(),
            autonomy_halt_secs: default_autonomy_halt_secs(),
            stale_tick_secs: default_stale_tick_secs(),
            max_bars_per_symbol: default_max_bars_per_symbol(),
            emergency_floor_bars: default_emergency_floor_bars(),
            cache_stale_secs: default_cache_stale_secs(),
            warmup_bars: default_warmup_bars(),
            bar_buffer_cap: default_bar_buffer_cap(),
            bootstrap_bars: default_bootstrap_bars(),
            time_stop_minutes: default_time_stop_minutes(),
            flatten_minutes: default_flatten_minutes(),
            auto_flatten: true,
            stop_ticks: default_stop_ticks(),
            target_ticks: default_target_ticks(),
            holidays: Vec::new(),
            lease_secs: default_lease_secs(),
            job_timeout_minutes: default_job_timeout_minutes(),
            providers: Vec::new(),
            provider_timeout_secs: default_provider_timeout_secs(),
            supermajority_required: true,
            ledger_path: default_ledger_path(),
            cold_store_path: default_cold_store_path(),
            data_api_url: default_data_api_url(),
            stream_url: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            holidays = config.holidays.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Look up the contract spec for `symbol`.
    pub fn instrument(&self, symbol: &str) -> Option<InstrumentSpec> {
        self.instruments.get(symbol).copied()
    }

    /// Holiday rule in effect on `date`, if any.
    pub fn holiday_on(&self, date: NaiveDate) -> Option<HolidayKind> {
        self.holidays
            .iter()
            .find(|h| h.date == date)
            .map(|h| h.kind)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["MES", "MNQ", "MYM", "M2K"]);
        assert_eq!(cfg.quote_fresh_secs, 30);
        assert_eq!(cfg.bar_fresh_multiplier, 2);
        assert_eq!(cfg.max_bars_per_symbol, 15_000);
        assert_eq!(cfg.emergency_floor_bars, 5_000);
        assert_eq!(cfg.warmup_bars, 21);
        assert_eq!(cfg.bar_buffer_cap, 100);
        assert!((cfg.stop_ticks - 20.0).abs() < f64::EPSILON);
        assert!((cfg.target_ticks - 40.0).abs() < f64::EPSILON);
        assert!(cfg.auto_flatten);
        assert!(cfg.supermajority_required);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 4);
        assert_eq!(cfg.lease_secs, 120);
        assert_eq!(cfg.job_timeout_minutes, 10);
        assert!(cfg.holidays.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["MES"], "flatten_minutes": 10 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["MES"]);
        assert_eq!(cfg.flatten_minutes, 10);
        assert_eq!(cfg.time_stop_minutes, 60);
    }

    #[test]
    fn holiday_lookup() {
        let json = r#"{
            "holidays": [
                { "date": "2025-07-04", "kind": "FULL_DAY_CLOSURE" },
                { "date": "2025-07-03", "kind": "EARLY_CLOSE" }
            ]
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        let d = NaiveDate::from_ymd_opt(2025, 7, 4).unwrap();
        assert_eq!(cfg.holiday_on(d), Some(HolidayKind::FullDayClosure));
        let d = NaiveDate::from_ymd_opt(2025, 7, 3).unwrap();
        assert_eq!(cfg.holiday_on(d), Some(HolidayKind::EarlyClose));
        let d = NaiveDate::from_ymd_opt(2025, 7, 2).unwrap();
        assert_eq!(cfg.holiday_on(d), None);
    }

    #[test]
    fn instrument_tick_value() {
        let cfg = RuntimeConfig::default();
        let mes = cfg.instrument("MES").unwrap();
        assert!((mes.tick_value() - 1.25).abs() < f64::EPSILON);
        assert!(cfg.instrument("UNKNOWN").is_none());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_bars_per_symbol, cfg2.max_bars_per_symbol);
        assert_eq!(cfg.lease_secs, cfg2.lease_secs);
    }
}
