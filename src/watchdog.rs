//! Deadlock watchdog for the host event loop.
//!
//! The host loop calls [`WatchdogHandle::increment`] on every iteration. A
//! dedicated thread wakes once per interval and compares the counter with the
//! value it saw last time. If the counter has not moved while the watchdog is
//! not paused, the loop is considered stalled and the stall action runs, which
//! by default logs and aborts the process so it can be restarted.
//!
//! Shared state is three atomics, so incrementing never takes a lock.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Details handed to the stall action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallReport {
    /// Counter value that failed to advance.
    pub counter: u64,
    /// Interval the counter was observed over.
    pub interval: Duration,
}

/// Callback run when a stall is detected.
pub type StallAction = Arc<dyn Fn(StallReport) + Send + Sync>;

#[derive(Debug)]
struct Shared {
    counter: AtomicU64,
    paused: AtomicBool,
    interval_ms: AtomicU64,
}

/// Cloneable handle used by the supervised loop.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    shared: Arc<Shared>,
}

impl WatchdogHandle {
    /// Record one loop iteration.
    pub fn increment(&self) {
        self.shared.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        self.shared.counter.load(Ordering::Relaxed)
    }

    /// Suspend stall detection, e.g. around a known long blocking call.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume stall detection.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Whether detection is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Pause until the returned guard is dropped.
    pub fn pause_guard(&self) -> PauseGuard {
        self.pause();
        PauseGuard { handle: self.clone() }
    }

    /// Raise the check interval. Requests to lower it are ignored.
    pub fn set_interval(&self, interval: Duration) {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let previous = self.shared.interval_ms.fetch_max(ms, Ordering::SeqCst);
        if ms > previous {
            log::info!("[Watchdog] Interval raised from {previous}ms to {ms}ms");
        }
    }

    /// Current check interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::SeqCst))
    }
}

/// Resumes the watchdog when dropped.
#[derive(Debug)]
pub struct PauseGuard {
    handle: WatchdogHandle,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.handle.resume();
    }
}

/// Owner of the watchdog thread.
pub struct Watchdog {
    shared: Arc<Shared>,
    action: StallAction,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("shared", &self.shared)
            .field("running", &self.thread_handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    /// Create a stopped watchdog.
    ///
    /// A `timeout` below `min_timeout` is raised to `min_timeout`.
    pub fn new(timeout: Duration, min_timeout: Duration) -> Self {
        let timeout = if timeout < min_timeout {
            log::warn!(
                "[Watchdog] Timeout {}ms below minimum, using {}ms",
                timeout.as_millis(),
                min_timeout.as_millis()
            );
            min_timeout
        } else {
            timeout
        };

        let shared = Arc::new(Shared {
            counter: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            interval_ms: AtomicU64::new(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        });

        Self {
            shared,
            action: Arc::new(abort_on_stall),
            stop_tx: None,
            thread_handle: None,
        }
    }

    /// Replace the stall action.
    #[must_use]
    pub fn with_action(mut self, action: impl Fn(StallReport) + Send + Sync + 'static) -> Self {
        self.action = Arc::new(action);
        self
    }

    /// Handle for the supervised loop.
    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle { shared: Arc::clone(&self.shared) }
    }

    /// Whether the watchdog thread is running.
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Spawn the watchdog thread. Does nothing if already running.
    pub fn start(&mut self) {
        if self.thread_handle.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = std_mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let action = Arc::clone(&self.action);

        let spawned = thread::Builder::new()
            .name("yap-watchdog".to_string())
            .spawn(move || Self::watch_loop(&shared, &action, &stop_rx));

        match spawned {
            Ok(handle) => {
                log::info!(
                    "[Watchdog] Started ({}ms interval)",
                    self.shared.interval_ms.load(Ordering::SeqCst)
                );
                self.stop_tx = Some(stop_tx);
                self.thread_handle = Some(handle);
            }
            Err(e) => log::error!("[Watchdog] Failed to spawn thread: {e}"),
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            log::info!("[Watchdog] Stopped");
        }
    }

    /// Watch loop - runs on the dedicated thread.
    fn watch_loop(shared: &Shared, action: &StallAction, stop_rx: &std_mpsc::Receiver<()>) {
        let load_interval = || Duration::from_millis(shared.interval_ms.load(Ordering::SeqCst));

        let mut interval = load_interval();
        let mut last_check = Instant::now();
        let mut last_seen: Option<u64> = None;

        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            }

            // A raised interval restarts the observation window.
            let current = load_interval();
            if current != interval {
                interval = current;
                last_check = Instant::now();
                continue;
            }

            let elapsed = last_check.elapsed();
            if elapsed < interval {
                log::warn!(
                    "[Watchdog] Timer fired early ({}ms of {}ms), skipping check",
                    elapsed.as_millis(),
                    interval.as_millis()
                );
                continue;
            }
            last_check = Instant::now();

            let counter = shared.counter.load(Ordering::Relaxed);
            if shared.paused.load(Ordering::SeqCst) {
                last_seen = Some(counter);
                continue;
            }

            if last_seen == Some(counter) {
                log::error!(
                    "[Watchdog] Event loop stalled: counter stuck at {counter} for {}ms",
                    interval.as_millis()
                );
                action(StallReport { counter, interval });
            }
            last_seen = Some(counter);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn abort_on_stall(report: StallReport) {
    log::error!(
        "[Watchdog] Deadlock detected (counter {}), aborting process",
        report.counter
    );
    std::process::abort();
}
