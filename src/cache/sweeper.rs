//! Background eviction sweeper.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

use super::engine::{CacheEngine, SweepTrigger};

/// Start sweeping `cache` every `interval`.
///
/// Returns a handle that keeps the sweeper alive. Drop it to stop sweeping.
pub fn start_sweeper(cache: Arc<CacheEngine>, interval: Duration) -> std::io::Result<SweeperHandle> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("cache-sweeper".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let report = cache.sweep(SweepTrigger::Interval);
                    debug!(evicted = report.evicted, remaining = report.remaining_entries, "periodic sweep");
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;

    info!(interval_secs = interval.as_secs(), "cache sweeper started");
    Ok(SweeperHandle {
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}

/// Handle that keeps the sweeper thread alive.
/// Drop this to stop sweeping.
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
