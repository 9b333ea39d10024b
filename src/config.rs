//! Journal configuration, mirroring `commitlog::Options`: a plain `Copy`
//! struct with a hand-written [`Default`] rather than a builder.

use std::time::Duration;

pub const MIN_FILE_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_FILE_SIZE: u64 = 1024 * 1024 * 1024;
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct JournalOptions {
    /// Size at which a segment rolls over. Clamped to
    /// `[MIN_FILE_SIZE, MAX_FILE_SIZE]` by [`JournalOptions::clamped`].
    ///
    /// Default: [`DEFAULT_FILE_SIZE`]
    pub maximum_file_size: u64,

    /// Size of the mapped write window.
    ///
    /// Default: 4MiB
    pub write_buffer_size: usize,

    /// Scratch buffer size used by the copy-back worker to read page
    /// images back out of a segment.
    ///
    /// Default: 64KiB
    pub read_buffer_size: usize,

    /// Interval between `force()` calls by the flush worker.
    ///
    /// Default: 100ms
    pub flush_interval: Duration,

    /// Interval between copy-back cycles.
    ///
    /// Default: 1000ms
    pub copier_interval: Duration,

    /// Minimum urgency score required for a copy-back cycle to run.
    ///
    /// Default: 2
    pub minimum_urgency: u32,

    /// Clamp applied to the I/O rate meter's reading before it scales the
    /// per-page copy-back sleep.
    ///
    /// Default: (2, 100)
    pub io_rate_min: u32,
    pub io_rate_max: u32,

    /// Scales the clamped I/O rate into a sleep duration (milliseconds) the
    /// copy-back worker waits between pages.
    ///
    /// Default: 0.5
    pub io_rate_sleep_multiplier: f64,

    /// Copy-back candidates with a timestamp above this value are never
    /// considered, regardless of checkpoint state.
    ///
    /// Default: `i64::MAX`
    pub copier_timestamp_limit: i64,

    /// Hard pause of the copy-back worker; the flush worker keeps running.
    ///
    /// Default: false
    pub suspend_copying: bool,

    /// Capacity of the handle registry before it self-clears.
    ///
    /// Default: [`crate::handle::DEFAULT_CAPACITY`]
    pub handle_registry_capacity: usize,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            maximum_file_size: DEFAULT_FILE_SIZE,
            write_buffer_size: 4 * 1024 * 1024,
            read_buffer_size: 64 * 1024,
            flush_interval: Duration::from_millis(100),
            copier_interval: Duration::from_millis(1000),
            minimum_urgency: 2,
            io_rate_min: 2,
            io_rate_max: 100,
            io_rate_sleep_multiplier: 0.5,
            copier_timestamp_limit: i64::MAX,
            suspend_copying: false,
            handle_registry_capacity: crate::handle::DEFAULT_CAPACITY,
        }
    }
}

impl JournalOptions {
    /// Returns a copy with `maximum_file_size` clamped into the allowed
    /// range, as the base spec requires of any configured value.
    pub fn clamped(mut self) -> Self {
        self.maximum_file_size = self.maximum_file_size.clamp(MIN_FILE_SIZE, MAX_FILE_SIZE);
        self
    }
}
