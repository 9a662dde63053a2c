// =============================================================================
// Indicators — incremental per-bar technical state
// =============================================================================
//
// One IndicatorSet lives inside each paper runner and is advanced exactly
// once per closed bar.  All math is incremental (no per-bar series
// recomputation) and CPU-only: nothing here suspends.
//
//   EMA 9/20/21   — seeded with the SMA of the first `period` closes
//   SMA 50        — rolling window
//   VWAP          — session-scoped sum(close*vol) / sum(vol)
//   RSI 14        — Wilder smoothing of average gain/loss
//   ATR 14        — Wilder smoothing of true range
//   momentum      — close - close[t-10]
//   session range — high/low since session start (prior-bar variant kept
//                   for breakout checks)
// =============================================================================

use std::collections::VecDeque;

use crate::market_data::Bar;

const MOMENTUM_LOOKBACK: usize = 10;
const HISTORY_LEN: usize = 20;
const SMA_PERIOD: usize = 50;

// ---------------------------------------------------------------------------
// EMA
// ---------------------------------------------------------------------------

/// Incremental EMA, seeded with the SMA of the first `period` values.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    pub fn update(&mut self, close: f64) {
        match self.value {
            Some(prev) => self.value = Some((close - prev) * self.k + prev),
            None => {
                self.seed_sum += close;
                self.seed_count += 1;
                if self.seed_count >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

// ---------------------------------------------------------------------------
// Wilder RSI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct WilderRsi {
    period: usize,
    prev_close: Option<f64>,
    seed_gain: f64,
    seed_loss: f64,
    seed_count: usize,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl WilderRsi {
    fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_gain: 0.0,
            seed_loss: 0.0,
            seed_count: 0,
            avg_gain: None,
            avg_loss: None,
        }
    }

    fn update(&mut self, close: f64) {
        let Some(prev) = self.prev_close.replace(close) else {
            return;
        };
        let delta = close - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                let p = self.period as f64;
                self.avg_gain = Some((ag * (p - 1.0) + gain) / p);
                self.avg_loss = Some((al * (p - 1.0) + loss) / p);
            }
            _ => {
                self.seed_gain += gain;
                self.seed_loss += loss;
                self.seed_count += 1;
                if self.seed_count >= self.period {
                    self.avg_gain = Some(self.seed_gain / self.period as f64);
                    self.avg_loss = Some(self.seed_loss / self.period as f64);
                }
            }
        }
    }

    fn value(&self) -> Option<f64> {
        let (ag, al) = (self.avg_gain?, self.avg_loss?);
        let rsi = if al == 0.0 && ag == 0.0 {
            50.0
        } else if al == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + ag / al)
        };
        rsi.is_finite().then_some(rsi)
    }
}

// ---------------------------------------------------------------------------
// Wilder ATR
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct WilderAtr {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl WilderAtr {
    fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    fn update(&mut self, bar: &Bar) {
        let tr = match self.prev_close {
            Some(prev) => (bar.high - bar.low)
                .max((bar.high - prev).abs())
                .max((bar.low - prev).abs()),
            None => bar.high - bar.low,
        };
        self.prev_close = Some(bar.close);

        match self.value {
            Some(prev) => {
                let p = self.period as f64;
                self.value = Some((prev * (p - 1.0) + tr) / p);
            }
            None => {
                self.seed_sum += tr;
                self.seed_count += 1;
                if self.seed_count >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}

// ---------------------------------------------------------------------------
// IndicatorSet
// ---------------------------------------------------------------------------

/// The complete indicator state for one runner.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    ema9: Ema,
    ema20: Ema,
    ema21: Ema,
    rsi: WilderRsi,
    atr: WilderAtr,
    closes: VecDeque<f64>,
    volumes: VecDeque<u64>,
    sma_window: VecDeque<f64>,
    vwap_pv: f64,
    vwap_v: f64,
    session_high: Option<f64>,
    session_low: Option<f64>,
    prev_session_high: Option<f64>,
    prev_session_low: Option<f64>,
    bars_seen: usize,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self {
            ema9: Ema::new(9),
            ema20: Ema::new(20),
            ema21: Ema::new(21),
            rsi: WilderRsi::new(14),
            atr: WilderAtr::new(14),
            closes: VecDeque::with_capacity(HISTORY_LEN + MOMENTUM_LOOKBACK + 1),
            volumes: VecDeque::with_capacity(HISTORY_LEN + 1),
            sma_window: VecDeque::with_capacity(SMA_PERIOD + 1),
            vwap_pv: 0.0,
            vwap_v: 0.0,
            session_high: None,
            session_low: None,
            prev_session_high: None,
            prev_session_low: None,
            bars_seen: 0,
        }
    }

    /// Advance every indicator with one closed bar.
    pub fn on_bar(&mut self, bar: &Bar) {
        self.bars_seen += 1;

        self.ema9.update(bar.close);
        self.ema20.update(bar.close);
        self.ema21.update(bar.close);
        self.rsi.update(bar.close);
        self.atr.update(bar);

        self.closes.push_back(bar.close);
        while self.closes.len() > HISTORY_LEN + MOMENTUM_LOOKBACK + 1 {
            self.closes.pop_front();
        }
        self.volumes.push_back(bar.volume);
        while self.volumes.len() > HISTORY_LEN {
            self.volumes.pop_front();
        }
        self.sma_window.push_back(bar.close);
        while self.sma_window.len() > SMA_PERIOD {
            self.sma_window.pop_front();
        }

        self.vwap_pv += bar.close * bar.volume as f64;
        self.vwap_v += bar.volume as f64;

        // Breakout checks compare against the range *before* this bar.
        self.prev_session_high = self.session_high;
        self.prev_session_low = self.session_low;
        self.session_high = Some(self.session_high.map_or(bar.high, |h| h.max(bar.high)));
        self.session_low = Some(self.session_low.map_or(bar.low, |l| l.min(bar.low)));
    }

    /// Reset session-scoped state (VWAP, session range) at session open.
    pub fn reset_session(&mut self) {
        self.vwap_pv = 0.0;
        self.vwap_v = 0.0;
        self.session_high = None;
        self.session_low = None;
        self.prev_session_high = None;
        self.prev_session_low = None;
    }

    // -- Accessors -----------------------------------------------------------

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    pub fn ema9(&self) -> Option<f64> {
        self.ema9.value()
    }

    pub fn ema20(&self) -> Option<f64> {
        self.ema20.value()
    }

    pub fn ema21(&self) -> Option<f64> {
        self.ema21.value()
    }

    pub fn sma50(&self) -> Option<f64> {
        (self.sma_window.len() >= SMA_PERIOD)
            .then(|| self.sma_window.iter().sum::<f64>() / self.sma_window.len() as f64)
    }

    pub fn rsi14(&self) -> Option<f64> {
        self.rsi.value()
    }

    pub fn atr14(&self) -> Option<f64> {
        self.atr.value()
    }

    pub fn vwap(&self) -> Option<f64> {
        (self.vwap_v > 0.0).then(|| self.vwap_pv / self.vwap_v)
    }

    /// close - close[t - 10].
    pub fn momentum(&self) -> Option<f64> {
        let n = self.closes.len();
        if n <= MOMENTUM_LOOKBACK {
            return None;
        }
        Some(self.closes[n - 1] - self.closes[n - 1 - MOMENTUM_LOOKBACK])
    }

    /// Session high before the current bar was applied.
    pub fn high_of_session_before_bar(&self) -> Option<f64> {
        self.prev_session_high
    }

    /// Session low before the current bar was applied.
    pub fn low_of_session_before_bar(&self) -> Option<f64> {
        self.prev_session_low
    }

    pub fn session_high(&self) -> Option<f64> {
        self.session_high
    }

    pub fn session_low(&self) -> Option<f64> {
        self.session_low
    }

    /// Most recent closes, oldest first, up to 20.
    pub fn price_history(&self) -> Vec<f64> {
        let start = self.closes.len().saturating_sub(HISTORY_LEN);
        self.closes.iter().skip(start).copied().collect()
    }

    /// Most recent volumes, oldest first, up to 20.
    pub fn volume_history(&self) -> Vec<u64> {
        self.volumes.iter().copied().collect()
    }
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, vol: u64) -> Bar {
        Bar {
            ts_event: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: vol,
        }
    }

    fn feed(set: &mut IndicatorSet, closes: &[f64]) {
        for &c in closes {
            set.on_bar(&bar(c, 10));
        }
    }

    #[test]
    fn ema_seeds_with_sma_then_smooths() {
        let mut ema = Ema::new(3);
        ema.update(1.0);
        ema.update(2.0);
        assert!(ema.value().is_none());
        ema.update(3.0);
        assert!((ema.value().unwrap() - 2.0).abs() < 1e-12);

        // k = 0.5 for period 3: next = (4 - 2) * 0.5 + 2 = 3.
        ema.update(4.0);
        assert!((ema.value().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rsi_extremes() {
        let mut up = IndicatorSet::new();
        feed(&mut up, &(1..=30).map(|x| x as f64).collect::<Vec<_>>());
        assert!((up.rsi14().unwrap() - 100.0).abs() < 1e-9);

        let mut down = IndicatorSet::new();
        feed(&mut down, &(1..=30).rev().map(|x| x as f64).collect::<Vec<_>>());
        assert!(down.rsi14().unwrap().abs() < 1e-9);

        let mut flat = IndicatorSet::new();
        feed(&mut flat, &[100.0; 30]);
        assert!((flat.rsi14().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_in_range() {
        let mut set = IndicatorSet::new();
        feed(
            &mut set,
            &[
                44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89,
                46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
            ],
        );
        let rsi = set.rsi14().unwrap();
        assert!((0.0..=100.0).contains(&rsi), "RSI {rsi} out of range");
    }

    #[test]
    fn atr_of_constant_range_bars() {
        let mut set = IndicatorSet::new();
        // Each bar has high-low = 2 and closes equal: TR = 2 throughout.
        feed(&mut set, &[100.0; 20]);
        assert!((set.atr14().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_weights_by_volume() {
        let mut set = IndicatorSet::new();
        set.on_bar(&bar(100.0, 10));
        set.on_bar(&bar(200.0, 30));
        // (100*10 + 200*30) / 40 = 175.
        assert!((set.vwap().unwrap() - 175.0).abs() < 1e-9);
    }

    #[test]
    fn session_reset_clears_vwap_and_range() {
        let mut set = IndicatorSet::new();
        feed(&mut set, &[100.0, 110.0, 90.0]);
        assert!(set.vwap().is_some());
        assert!((set.session_high().unwrap() - 111.0).abs() < 1e-9);
        assert!((set.session_low().unwrap() - 89.0).abs() < 1e-9);

        set.reset_session();
        assert!(set.vwap().is_none());
        assert!(set.session_high().is_none());

        set.on_bar(&bar(105.0, 5));
        assert!((set.session_high().unwrap() - 106.0).abs() < 1e-9);
        // Momentum history survives the session reset.
        assert!(set.bars_seen() == 4);
    }

    #[test]
    fn momentum_needs_lookback() {
        let mut set = IndicatorSet::new();
        feed(&mut set, &(1..=10).map(|x| x as f64).collect::<Vec<_>>());
        assert!(set.momentum().is_none());

        set.on_bar(&bar(20.0, 1));
        // close = 20, close[t-10] = 1.
        assert!((set.momentum().unwrap() - 19.0).abs() < 1e-9);
    }

    #[test]
    fn sma50_needs_full_window() {
        let mut set = IndicatorSet::new();
        feed(&mut set, &vec![10.0; 49]);
        assert!(set.sma50().is_none());
        set.on_bar(&bar(10.0, 1));
        assert!((set.sma50().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn breakout_range_excludes_current_bar() {
        let mut set = IndicatorSet::new();
        set.on_bar(&bar(100.0, 1)); // high 101
        set.on_bar(&bar(105.0, 1)); // high 106
        assert!((set.high_of_session_before_bar().unwrap() - 101.0).abs() < 1e-9);
        assert!((set.session_high().unwrap() - 106.0).abs() < 1e-9);
    }

    #[test]
    fn histories_are_capped() {
        let mut set = IndicatorSet::new();
        feed(&mut set, &(1..=40).map(|x| x as f64).collect::<Vec<_>>());
        assert_eq!(set.price_history().len(), 20);
        assert_eq!(set.volume_history().len(), 20);
        assert!((set.price_history()[19] - 40.0).abs() < 1e-9);
    }
}
