//! Periodic Background Work
//!
//! [`PeriodicTask`] runs a closure on a fixed interval until stopped. It owns
//! its shutdown signal and join handle, so stopping is synchronous: after
//! [`PeriodicTask::stop`] returns, the closure will not run again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::duration_millis;

/// Minimum tick interval
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running periodic task
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    stopped: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `interval` on the current Tokio runtime
    ///
    /// The first tick fires one full interval after spawning. Missed ticks
    /// are skipped rather than bunched.
    pub fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let stopped = Arc::new(AtomicBool::new(false));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let flag = Arc::clone(&stopped);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if flag.load(Ordering::SeqCst) {
                            break;
                        }
                        tick();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::trace!(task = name, "Periodic task exited");
        });

        tracing::debug!(
            task = name,
            interval_ms = duration_millis(interval),
            "Periodic task started"
        );

        Self {
            name,
            stopped,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Task name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether [`stop`](Self::stop) has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the task; idempotent
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        tracing::debug!(task = self.name, "Periodic task stopped");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
