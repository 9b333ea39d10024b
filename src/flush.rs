//! Background flush worker: periodically forces the active segment's
//! mapped write window to stable storage so committed pages survive a
//! crash without waiting for the next rollover or copy-back cycle.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

/// Runs a caller-supplied `force` closure on a timer until told to stop.
///
/// Takes a closure rather than a typed writer handle so it can force
/// through whatever lock the journal manager actually serializes its
/// segment writer with -- the base design's single monitor, in practice.
///
/// Owns its own thread; [`crate::manager::JournalManager`] holds the
/// worker and drops it (or calls [`Self::shutdown`] explicitly) on close.
pub struct FlushWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub fn spawn<F>(interval: Duration, mut force: F) -> Self
    where
        F: FnMut() -> io::Result<()> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("journal-flush".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = force() {
                        warn!("flush worker: force failed: {err}");
                    }
                }
            })
            .expect("failed to spawn journal-flush thread");

        Self { stop, handle: Some(handle) }
    }

    /// Signals the worker to stop and joins its thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
