//! Rolling-window transfer rate meters.
//!
//! Records `(tick, bytes)` samples and derives bytes/second over the
//! most recent window. The scheduler keeps two meters per direction:
//! a short-window one feeding the bandwidth budget and a long-window
//! one for stable display rates.

use std::collections::VecDeque;

/// Window of the budget meters; one second makes `speed()` read
/// directly as bytes/second.
pub const BUDGET_WINDOW_MS: u64 = 1_000;

/// Window of the display meters; longer history, smoother numbers.
pub const DISPLAY_WINDOW_MS: u64 = 5_000;

/// Tick-driven rolling-window rate meter.
#[derive(Debug)]
pub struct SpeedMeter {
    samples: VecDeque<(u64, u32)>,
    window_ms: u64,
    in_window: u64,
    total: u64,
}

impl SpeedMeter {
    pub fn new(window_ms: u64) -> Self {
        debug_assert!(window_ms > 0);
        Self {
            samples: VecDeque::with_capacity(256),
            window_ms,
            in_window: 0,
            total: 0,
        }
    }

    /// Record `bytes` transferred at `tick` (milliseconds).
    pub fn add(&mut self, tick: u64, bytes: u32) {
        self.samples.push_back((tick, bytes));
        self.in_window += bytes as u64;
        self.total += bytes as u64;
        self.evict(tick);
    }

    /// Current rate in bytes/second as of `tick`.
    pub fn speed(&mut self, tick: u64) -> u32 {
        self.evict(tick);
        let rate = self.in_window * 1_000 / self.window_ms;
        rate.min(u32::MAX as u64) as u32
    }

    /// Lifetime byte total.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn evict(&mut self, tick: u64) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if ts + self.window_ms <= tick {
                self.samples.pop_front();
                self.in_window -= bytes as u64;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_meter_is_zero() {
        let mut m = SpeedMeter::new(BUDGET_WINDOW_MS);
        assert_eq!(m.speed(0), 0);
        assert_eq!(m.total(), 0);
    }

    #[test]
    fn bytes_within_window_count() {
        let mut m = SpeedMeter::new(1_000);
        m.add(0, 10_000);
        m.add(500, 6_000);
        assert_eq!(m.speed(500), 16_000);
        assert_eq!(m.total(), 16_000);
    }

    #[test]
    fn old_samples_are_evicted() {
        let mut m = SpeedMeter::new(1_000);
        m.add(0, 10_000);
        m.add(1_500, 4_000);
        // The first sample left the window; only the second counts.
        assert_eq!(m.speed(1_500), 4_000);
        // Lifetime total never shrinks.
        assert_eq!(m.total(), 14_000);
    }

    #[test]
    fn longer_window_smooths() {
        let mut m = SpeedMeter::new(5_000);
        m.add(0, 10_000);
        m.add(4_000, 10_000);
        // 20 kB over 5 s.
        assert_eq!(m.speed(4_000), 4_000);
    }
}
