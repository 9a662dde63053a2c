// =============================================================================
// BarBuffer -- thread-safe live-bar ring per (symbol, timeframe)
// =============================================================================
//
// Holds the most recent bars delivered by the live data router.  The
// in-progress bar of each series is kept separately and updated in place;
// when a bar closes it becomes permanent and the ring is trimmed to
// `max_bars`.  The Price Authority reads the tail of this buffer when no
// quote tick is available.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use super::{Bar, BarKey};

struct Series {
    closed: VecDeque<Bar>,
    in_progress: Option<Bar>,
}

impl Series {
    fn new(cap: usize) -> Self {
        Self {
            closed: VecDeque::with_capacity(cap + 1),
            in_progress: None,
        }
    }
}

/// Thread-safe ring buffer of live bars keyed by `(symbol, timeframe)`.
pub struct BarBuffer {
    series: RwLock<HashMap<BarKey, Series>>,
    max_bars: usize,
}

impl BarBuffer {
    /// Create a buffer that retains at most `max_bars` closed bars per key,
    /// plus one in-progress bar.
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Insert or replace the latest bar for the given key.
    ///
    /// * A closed bar is appended (replacing any in-progress bar with the
    ///   same `ts_event`) and the ring is trimmed to `max_bars`.
    /// * An open bar replaces the current in-progress bar.
    pub fn update(&self, key: BarKey, bar: Bar, closed: bool) {
        let mut map = self.series.write();
        let series = map
            .entry(key)
            .or_insert_with(|| Series::new(self.max_bars));

        if closed {
            if let Some(ip) = &series.in_progress {
                if ip.ts_event == bar.ts_event {
                    series.in_progress = None;
                }
            }
            // Ignore a duplicate close of a bar we already have.
            if series.closed.back().map(|b| b.ts_event) != Some(bar.ts_event) {
                series.closed.push_back(bar);
            } else if let Some(last) = series.closed.back_mut() {
                *last = bar;
            }
            while series.closed.len() > self.max_bars {
                series.closed.pop_front();
            }
        } else {
            series.in_progress = Some(bar);
        }
    }

    /// The most recent `count` **closed** bars, oldest first.
    pub fn get_closed(&self, key: &BarKey, count: usize) -> Vec<Bar> {
        let map = self.series.read();
        match map.get(key) {
            Some(series) => {
                let start = series.closed.len().saturating_sub(count);
                series.closed.iter().skip(start).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// The most recent closed bar, if any.
    pub fn last_closed(&self, key: &BarKey) -> Option<Bar> {
        let map = self.series.read();
        map.get(key).and_then(|s| s.closed.back().copied())
    }

    /// Close price of the most recent closed bar, if any.
    pub fn last_close(&self, key: &BarKey) -> Option<f64> {
        self.last_closed(key).map(|b| b.close)
    }

    /// Number of closed bars stored for a key.
    pub fn count(&self, key: &BarKey) -> usize {
        let map = self.series.read();
        map.get(key).map_or(0, |s| s.closed.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bar(ts_min: i64, close: f64) -> Bar {
        Bar {
            ts_event: ts_min * 60_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100,
        }
    }

    fn key() -> BarKey {
        BarKey::one_minute("MES")
    }

    #[test]
    fn ring_trims_to_cap() {
        let buf = BarBuffer::new(3);
        for i in 0..5 {
            buf.update(key(), sample_bar(i, 100.0 + i as f64), true);
        }
        assert_eq!(buf.count(&key()), 3);
        let closes: Vec<f64> = buf.get_closed(&key(), 10).iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_replaced_then_finalised() {
        let buf = BarBuffer::new(10);
        buf.update(key(), sample_bar(0, 50.0), false);
        assert_eq!(buf.count(&key()), 0);
        assert_eq!(buf.last_close(&key()), None);

        buf.update(key(), sample_bar(0, 51.0), false);
        buf.update(key(), sample_bar(0, 52.0), true);
        assert_eq!(buf.count(&key()), 1);
        assert_eq!(buf.last_close(&key()), Some(52.0));
    }

    #[test]
    fn duplicate_close_overwrites_in_place() {
        let buf = BarBuffer::new(10);
        buf.update(key(), sample_bar(0, 10.0), true);
        buf.update(key(), sample_bar(0, 11.0), true);
        assert_eq!(buf.count(&key()), 1);
        assert_eq!(buf.last_close(&key()), Some(11.0));
    }

    #[test]
    fn unknown_key_is_empty() {
        let buf = BarBuffer::new(10);
        assert!(buf.get_closed(&key(), 5).is_empty());
        assert_eq!(buf.last_closed(&key()), None);
    }
}
