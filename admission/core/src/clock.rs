//! Monotonic Time Source
//!
//! Every time-dependent decision in the admission core (token refill, quota
//! windows, stale sweeps, circuit reset, the throttle window) reads the time
//! through [`Clock`]. Production code uses [`SystemClock`]; tests drive a
//! [`ManualClock`] forward explicitly so refill math and window rollovers can
//! be asserted without real waiting.
//!
//! Timers that only bound how long a caller waits (acquire timeouts, task
//! timeouts) run on the Tokio timer and are not affected by the clock.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time
pub trait Clock: Send + Sync + Debug {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Shared clock handle used by all components
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock backed monotonic time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl SystemClock {
    /// Create a shared system clock
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

/// A clock that only moves when told to
///
/// Starts at the instant it was created and advances by explicit calls to
/// [`ManualClock::advance`].
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a shared manual clock
    ///
    /// Returns the concrete handle (for advancing) alongside the trait
    /// object handed to components.
    #[must_use]
    pub fn shared() -> (Arc<Self>, SharedClock) {
        let clock = Arc::new(Self::new());
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since creation
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
#[must_use]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
