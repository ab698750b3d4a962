//! Tick timing and cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Tracks elapsed time since the start of a tick
pub struct TickTimer {
    start: Instant,
}

impl TickTimer {
    /// Start timing now
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left in an `interval`-long tick, zero once the tick has overrun
    pub fn remaining(&self, interval: Duration) -> Duration {
        remaining_interval(interval, self.elapsed())
    }
}

/// `interval - elapsed`, never negative
///
/// Each tick is measured from its own start, so an overrun is not carried
/// into the following ticks.
pub fn remaining_interval(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Outcome of a cancellable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The full duration passed
    Elapsed,
    /// A stop was requested before the duration passed
    Stopped,
}

/// Shareable stop request for a running sampler
///
/// Cloning gives another handle to the same signal. [`StopHandle::stop`] may be
/// called from any thread, including a Ctrl+C handler, and wakes a sampler
/// that is sleeping between ticks.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    /// Request a stop
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // A full channel already holds a pending wake-up
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless a stop arrives first
    pub fn wait(&self, duration: Duration) -> Wait {
        if self.is_stopped() {
            return Wait::Stopped;
        }
        let deadline = match Instant::now().checked_add(duration) {
            Some(deadline) => deadline,
            // Too far out to represent; only a stop ends the wait
            None => loop {
                let _ = self.wake_rx.recv();
                if self.is_stopped() {
                    return Wait::Stopped;
                }
            },
        };
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wait::Elapsed;
            }
            match self.wake_rx.recv_timeout(deadline - now) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if self.is_stopped() {
                        return Wait::Stopped;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return if self.is_stopped() {
                        Wait::Stopped
                    } else {
                        Wait::Elapsed
                    };
                }
            }
        }
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}
