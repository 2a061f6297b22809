//! Throughput accounting for a transport connection

use log::debug;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default reporting interval
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Average rate over one reporting window, in bytes per millisecond
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub up: f64,
    pub down: f64,
}

struct MeterState {
    up: u64,
    down: u64,
    window_start: Instant,
    window_up: u64,
    window_down: u64,
}

/// ThroughputMeter counts bytes in both directions and reports the rate
/// once per interval
pub struct ThroughputMeter {
    label: String,
    interval: Duration,
    state: Mutex<MeterState>,
}

impl ThroughputMeter {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_interval(label, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval(label: impl Into<String>, interval: Duration) -> Self {
        ThroughputMeter {
            label: label.into(),
            interval,
            state: Mutex::new(MeterState {
                up: 0,
                down: 0,
                window_start: Instant::now(),
                window_up: 0,
                window_down: 0,
            }),
        }
    }

    /// Count transferred bytes; returns the window rate when a report is due
    pub fn record(&self, up: usize, down: usize) -> Option<Rate> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.up += up as u64;
        state.down += down as u64;

        let now = Instant::now();
        let elapsed = now.duration_since(state.window_start);
        if elapsed <= self.interval {
            return None;
        }

        let millis = (elapsed.as_secs_f64() * 1000.0).max(f64::MIN_POSITIVE);
        let rate = Rate {
            up: (state.up - state.window_up) as f64 / millis,
            down: (state.down - state.window_down) as f64 / millis,
        };

        state.window_start = now;
        state.window_up = state.up;
        state.window_down = state.down;

        debug!("[{}] up {:.2} KB/s, down {:.2} KB/s", self.label, rate.up, rate.down);
        Some(rate)
    }

    pub fn record_up(&self, len: usize) {
        self.record(len, 0);
    }

    pub fn record_down(&self, len: usize) {
        self.record(0, len);
    }

    /// Cumulative (up, down) byte counts
    pub fn totals(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.up, state.down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let meter = ThroughputMeter::with_interval("t", Duration::from_secs(3600));
        assert!(meter.record(10, 0).is_none());
        meter.record_up(5);
        meter.record_down(7);
        assert_eq!(meter.totals(), (15, 7));
    }

    #[test]
    fn report_covers_only_the_window() {
        let meter = ThroughputMeter::with_interval("t", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        let first = meter.record(1000, 500).expect("report due");
        assert!(first.up > 0.0 && first.down > 0.0);
        assert!(first.up > first.down);

        std::thread::sleep(Duration::from_millis(2));
        let second = meter.record(0, 0).expect("report due");
        assert_eq!(second.up, 0.0);
        assert_eq!(second.down, 0.0);
        assert_eq!(meter.totals(), (1000, 500));
    }
}
