use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::writer::LogWriter;

/// The open log, shared between the database and the sync timer.
pub type SharedLogWriter = Arc<Mutex<Option<LogWriter>>>;

/// Background thread that syncs the log every `write_delay` ticks.
///
/// Sync failures are reported and otherwise ignored; the next tick retries.
pub struct LogSyncTimer {
    /// Channel used to stop the worker
    shutdown: Sender<()>,
    /// Delay in ticks, shared with the worker so it can change at runtime
    write_delay: Arc<AtomicU32>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl LogSyncTimer {
    /// Spawns the timer thread. One tick is normally one second.
    pub fn start(writer: SharedLogWriter, tick_interval: Duration, write_delay: u32) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let write_delay = Arc::new(AtomicU32::new(write_delay));
        let delay = Arc::clone(&write_delay);
        let ticker = tick(tick_interval);

        let worker_handle = thread::spawn(move || {
            Self::run(writer, ticker, shutdown_rx, delay);
        });

        Self {
            shutdown: shutdown_tx,
            write_delay,
            worker_handle: Some(worker_handle),
        }
    }

    fn run(
        writer: SharedLogWriter,
        ticker: Receiver<std::time::Instant>,
        shutdown: Receiver<()>,
        write_delay: Arc<AtomicU32>,
    ) {
        let mut ticks: u32 = 0;
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {
                    ticks = ticks.saturating_add(1);
                    if ticks < write_delay.load(Ordering::Relaxed) {
                        continue;
                    }
                    ticks = 0;
                    if let Some(log) = writer.lock().as_mut() {
                        match log.sync() {
                            Ok(()) => trace!(size = log.size(), "log synced"),
                            Err(e) => warn!(error = %e, "periodic log sync failed"),
                        }
                    }
                }
            }
        }
    }

    /// Changes the number of ticks between syncs; 0 syncs on every tick.
    pub fn set_write_delay(&self, ticks: u32) {
        self.write_delay.store(ticks, Ordering::Relaxed);
    }

    pub fn write_delay(&self) -> u32 {
        self.write_delay.load(Ordering::Relaxed)
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogSyncTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
