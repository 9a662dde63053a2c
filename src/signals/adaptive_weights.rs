// =============================================================================
// Adaptive Weights — performance-based source reweighting
// =============================================================================
//
// Recomputes per-source fusion weights from completed backtests with
// exponential time decay (0.95 per day of age).  Raw scores normalize to a
// weight set that sums to 1 with every weight inside [floor, ceiling],
// enforced by iterative projection.  A win-rate regime classifier labels
// the window so downstream consumers can reason about the conditions the
// weights were fitted under.  Results are cached per bot behind a
// rebalance interval.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::SharedClock;

const DECAY_PER_DAY: f64 = 0.95;
const MS_PER_DAY: f64 = 86_400_000.0;
const PROJECTION_ITERATIONS: usize = 10;

/// Market regime inferred from the backtest window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
    Unknown,
}

/// One completed backtest observation for a source.
#[derive(Debug, Clone)]
pub struct BacktestSample {
    pub source_id: String,
    /// Fitness of the run (sign matters; scale is source-relative).
    pub performance: f64,
    /// Win rate of the run in [0, 1].
    pub win_rate: f64,
    pub completed_at_ms: i64,
}

/// A computed weight set.
#[derive(Debug, Clone, Serialize)]
pub struct WeightSet {
    pub weights: HashMap<String, f64>,
    pub regime: Regime,
    pub computed_at_ms: i64,
    pub sample_count: usize,
}

/// Reweighting engine with a per-bot cache.
pub struct AdaptiveWeights {
    clock: SharedClock,
    floor: f64,
    ceiling: f64,
    lookback_days: i64,
    rebalance_interval_ms: i64,
    cache: RwLock<HashMap<String, WeightSet>>,
}

impl AdaptiveWeights {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            floor: 0.05,
            ceiling: 0.70,
            lookback_days: 14,
            rebalance_interval_ms: 3_600_000,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Weights for a bot (or `"global"`), recomputing only when the cached
    /// set is older than the rebalance interval.
    pub fn weights_for(
        &self,
        bot_id: &str,
        samples: &[BacktestSample],
        source_ids: &[String],
    ) -> WeightSet {
        let now = self.clock.now_ms();

        if let Some(cached) = self.cache.read().get(bot_id) {
            if now - cached.computed_at_ms < self.rebalance_interval_ms {
                return cached.clone();
            }
        }

        let set = self.compute(samples, source_ids, now);
        self.cache.write().insert(bot_id.to_string(), set.clone());
        set
    }

    /// Drop a bot's cached weights (account reset, generation change).
    pub fn invalidate(&self, bot_id: &str) {
        self.cache.write().remove(bot_id);
    }

    /// Pure recompute: decayed average score per source, projected into
    /// bounds.
    pub fn compute(
        &self,
        samples: &[BacktestSample],
        source_ids: &[String],
        now_ms: i64,
    ) -> WeightSet {
        let cutoff = now_ms - self.lookback_days * 86_400_000;

        let mut sums: HashMap<&str, (f64, f64)> = HashMap::new();
        let mut win_rates: Vec<f64> = Vec::new();
        let mut counted = 0usize;

        for sample in samples {
            if sample.completed_at_ms < cutoff {
                continue;
            }
            let age_days = ((now_ms - sample.completed_at_ms) as f64 / MS_PER_DAY).max(0.0);
            let decay = DECAY_PER_DAY.powf(age_days);
            let entry = sums.entry(sample.source_id.as_str()).or_insert((0.0, 0.0));
            entry.0 += sample.performance * decay;
            entry.1 += decay;
            win_rates.push(sample.win_rate);
            counted += 1;
        }

        // Raw score = decayed average performance, shifted so the worst
        // source is at zero (weights must be non-negative).
        let mut raw: HashMap<String, f64> = HashMap::new();
        for id in source_ids {
            let score = sums
                .get(id.as_str())
                .map(|(sum, total)| if *total > 0.0 { sum / total } else { 0.0 })
                .unwrap_or(0.0);
            raw.insert(id.clone(), score);
        }
        let min_score = raw.values().cloned().fold(f64::MAX, f64::min);
        if min_score < 0.0 {
            for v in raw.values_mut() {
                *v -= min_score;
            }
        }

        let weights = project_to_bounds(raw, self.floor, self.ceiling);

        WeightSet {
            weights,
            regime: classify_regime(&win_rates),
            computed_at_ms: now_ms,
            sample_count: counted,
        }
    }
}

/// Normalize `raw` to sum to 1 with each value in [floor, ceiling] when the
/// bounds are feasible, via iterative projection (clamp, then redistribute
/// the residual over unclamped entries).
pub fn project_to_bounds(
    raw: HashMap<String, f64>,
    floor: f64,
    ceiling: f64,
) -> HashMap<String, f64> {
    let n = raw.len();
    if n == 0 {
        return raw;
    }

    // Infeasible bounds degrade to a uniform split.
    if (n as f64) * floor > 1.0 || (n as f64) * ceiling < 1.0 {
        let uniform = 1.0 / n as f64;
        return raw.keys().map(|k| (k.clone(), uniform)).collect();
    }

    // Start from proportional shares (uniform when everything is zero).
    let total: f64 = raw.values().sum();
    let mut weights: HashMap<String, f64> = if total > f64::EPSILON {
        raw.iter().map(|(k, v)| (k.clone(), v / total)).collect()
    } else {
        raw.keys().map(|k| (k.clone(), 1.0 / n as f64)).collect()
    };

    for _ in 0..PROJECTION_ITERATIONS {
        for v in weights.values_mut() {
            *v = v.clamp(floor, ceiling);
        }

        let sum: f64 = weights.values().sum();
        let residual = 1.0 - sum;
        if residual.abs() < 1e-9 {
            break;
        }

        // Redistribute over entries that still have headroom in the needed
        // direction.
        let free: Vec<String> = weights
            .iter()
            .filter(|(_, v)| {
                if residual > 0.0 {
                    **v < ceiling - 1e-12
                } else {
                    **v > floor + 1e-12
                }
            })
            .map(|(k, _)| k.clone())
            .collect();
        if free.is_empty() {
            break;
        }
        let share = residual / free.len() as f64;
        for k in free {
            if let Some(v) = weights.get_mut(&k) {
                *v += share;
            }
        }
    }

    weights
}

/// Label the window from win-rate mean and standard deviation.
pub fn classify_regime(win_rates: &[f64]) -> Regime {
    if win_rates.len() < 5 {
        return Regime::Unknown;
    }
    let n = win_rates.len() as f64;
    let mean = win_rates.iter().sum::<f64>() / n;
    let variance = win_rates.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    if stddev > 0.15 {
        Regime::Volatile
    } else if mean >= 0.55 {
        Regime::Trending
    } else {
        Regime::Ranging
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::clock::Clock;
    use chrono::{Duration, TimeZone, Utc};

    fn sources(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sample(id: &str, perf: f64, wr: f64, age_days: i64, now_ms: i64) -> BacktestSample {
        BacktestSample {
            source_id: id.to_string(),
            performance: perf,
            win_rate: wr,
            completed_at_ms: now_ms - age_days * 86_400_000,
        }
    }

    fn engine() -> (Arc<AdaptiveWeights>, i64) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap());
        let now = clock.now_ms();
        (AdaptiveWeights::new(clock), now)
    }

    #[test]
    fn projection_sums_to_one_within_bounds() {
        let mut raw = HashMap::new();
        raw.insert("a".to_string(), 100.0);
        raw.insert("b".to_string(), 1.0);
        raw.insert("c".to_string(), 1.0);
        raw.insert("d".to_string(), 1.0);

        let weights = project_to_bounds(raw, 0.05, 0.70);
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum = {sum}");
        for (k, v) in &weights {
            assert!(*v >= 0.05 - 1e-9, "{k} below floor: {v}");
            assert!(*v <= 0.70 + 1e-9, "{k} above ceiling: {v}");
        }
        // Dominant source pinned at the ceiling.
        assert!((weights["a"] - 0.70).abs() < 1e-6);
    }

    #[test]
    fn projection_handles_all_zero_scores() {
        let mut raw = HashMap::new();
        for id in ["a", "b", "c"] {
            raw.insert(id.to_string(), 0.0);
        }
        let weights = project_to_bounds(raw, 0.05, 0.70);
        for v in weights.values() {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn infeasible_bounds_fall_back_to_uniform() {
        let mut raw = HashMap::new();
        raw.insert("a".to_string(), 5.0);
        raw.insert("b".to_string(), 1.0);
        // floor 0.6 * 2 sources > 1: infeasible.
        let weights = project_to_bounds(raw, 0.6, 0.9);
        assert!((weights["a"] - 0.5).abs() < 1e-9);
        assert!((weights["b"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn newer_samples_dominate_via_decay() {
        let (engine, now) = engine();
        let ids = sources(&["fresh", "old"]);
        let samples = vec![
            // "old" was great ten days ago; "fresh" is good now.
            sample("old", 100.0, 0.5, 10, now),
            sample("fresh", 60.0, 0.5, 0, now),
        ];
        let set = engine.compute(&samples, &ids, now);
        // 100 * 0.95^10 ~= 59.9 < 60, so fresh edges out old.
        assert!(set.weights["fresh"] > set.weights["old"]);
    }

    #[test]
    fn lookback_excludes_ancient_samples() {
        let (engine, now) = engine();
        let ids = sources(&["a", "b"]);
        let samples = vec![
            sample("a", 500.0, 0.9, 30, now), // outside 14-day lookback
            sample("b", 10.0, 0.5, 1, now),
        ];
        let set = engine.compute(&samples, &ids, now);
        assert_eq!(set.sample_count, 1);
        assert!(set.weights["b"] > set.weights["a"]);
    }

    #[test]
    fn negative_scores_shift_non_negative() {
        let (engine, now) = engine();
        let ids = sources(&["bad", "worse", "ok"]);
        let samples = vec![
            sample("bad", -30.0, 0.4, 0, now),
            sample("worse", -80.0, 0.3, 0, now),
            sample("ok", 5.0, 0.55, 0, now),
        ];
        let set = engine.compute(&samples, &ids, now);
        let sum: f64 = set.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(set.weights["ok"] > set.weights["bad"]);
        assert!(set.weights["bad"] > set.weights["worse"]);
    }

    #[test]
    fn regime_classification() {
        assert_eq!(classify_regime(&[0.5, 0.6]), Regime::Unknown);
        assert_eq!(
            classify_regime(&[0.6, 0.62, 0.58, 0.61, 0.60]),
            Regime::Trending
        );
        assert_eq!(
            classify_regime(&[0.45, 0.46, 0.44, 0.47, 0.45]),
            Regime::Ranging
        );
        assert_eq!(
            classify_regime(&[0.2, 0.8, 0.3, 0.7, 0.25]),
            Regime::Volatile
        );
    }

    #[test]
    fn cache_respects_rebalance_interval() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap());
        let engine = AdaptiveWeights::new(clock.clone());
        let now = clock.now_ms();
        let ids = sources(&["a", "b"]);

        let first = engine.weights_for("bot-1", &[sample("a", 10.0, 0.5, 0, now)], &ids);

        // New evidence inside the interval is ignored.
        let second = engine.weights_for("bot-1", &[sample("b", 99.0, 0.5, 0, now)], &ids);
        assert_eq!(first.computed_at_ms, second.computed_at_ms);
        assert_eq!(first.weights, second.weights);

        // After the interval, the recompute picks it up.
        clock.advance(Duration::hours(2));
        let third = engine.weights_for(
            "bot-1",
            &[sample("b", 99.0, 0.5, 0, clock.now_ms())],
            &ids,
        );
        assert!(third.computed_at_ms > first.computed_at_ms);
        assert!(third.weights["b"] > third.weights["a"]);

        // Invalidation forces recompute immediately.
        engine.invalidate("bot-1");
        let fourth = engine.weights_for("bot-1", &[], &ids);
        assert_eq!(fourth.sample_count, 0);
    }
}
