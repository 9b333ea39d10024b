//! Exponential-decay estimator of the current page-I/O rate, used to pace
//! the copy-back worker so it doesn't saturate the disk the buffer pool is
//! also using.

use std::time::{Duration, Instant};

const INTERVAL: Duration = Duration::from_millis(100);
const DECAY: f64 = 0.66;
const NORMALIZE: f64 = 100.0 / 27.0;
const IDLE_RESET_INTERVALS: u32 = 24;

/// Tracks a decaying count of page I/Os per 100ms interval. Process-private;
/// not shared across journal instances.
pub struct IoRateMeter {
    last_update: Instant,
    rate: f64,
    idle_intervals: u32,
}

impl IoRateMeter {
    pub fn new() -> Self {
        Self {
            last_update: Instant::now(),
            rate: 0.0,
            idle_intervals: 0,
        }
    }

    /// Advances the meter by however many whole 100ms intervals have passed
    /// since the last call, decaying the rate once per elapsed interval,
    /// then folds in `delta` page I/Os. Returns the normalized integer
    /// rate after the update.
    pub fn update(&mut self, delta: u32) -> u32 {
        let elapsed = self.last_update.elapsed();
        let intervals = (elapsed.as_millis() / INTERVAL.as_millis()) as u32;

        if intervals > 0 {
            self.rate *= DECAY.powi(intervals as i32);
            self.last_update += INTERVAL * intervals;

            if delta == 0 {
                self.idle_intervals = self.idle_intervals.saturating_add(intervals);
                if self.idle_intervals > IDLE_RESET_INTERVALS {
                    self.rate = 0.0;
                    self.idle_intervals = 0;
                }
            } else {
                self.idle_intervals = 0;
            }
        }

        if delta > 0 {
            self.rate += delta as f64;
        }

        self.normalized()
    }

    /// Reads the current normalized rate without recording any new I/O.
    pub fn rate(&mut self) -> u32 {
        self.update(0)
    }

    fn normalized(&self) -> u32 {
        (self.rate * NORMALIZE).round() as u32
    }
}

impl Default for IoRateMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_meter_reads_zero() {
        let mut meter = IoRateMeter::new();
        assert_eq!(meter.rate(), 0);
    }

    #[test]
    fn recording_io_raises_the_rate() {
        let mut meter = IoRateMeter::new();
        meter.update(1);
        assert!(meter.rate() > 0 || meter.update(0) >= 0);
    }

    proptest::proptest! {
        #[test]
        fn rate_never_goes_negative_under_arbitrary_update_sequences(deltas in proptest::collection::vec(0u32..20, 0..50)) {
            let mut meter = IoRateMeter::new();
            for delta in deltas {
                let rate = meter.update(delta);
                // u32, so this is really asserting normalized() never panics
                // on a negative-to-unsigned cast; kept explicit for clarity.
                proptest::prop_assert!(rate < u32::MAX);
            }
        }

    }

    #[test]
    fn a_burst_of_idle_reads_eventually_decays_to_zero() {
        let mut meter = IoRateMeter::new();
        meter.update(7);
        assert!(meter.rate() > 0);
        for _ in 0..IDLE_RESET_INTERVALS + 2 {
            std::thread::sleep(INTERVAL);
            meter.update(0);
        }
        assert_eq!(meter.rate(), 0);
    }
}
