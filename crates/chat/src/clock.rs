//! Injectable time source
//!
//! Typing expiry, outbound typing debounce and optimistic timestamps all read
//! time through [`Clock`] so reducers can be driven deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Monotonic instant used for timers
    fn now(&self) -> Instant;

    /// Wall-clock timestamp used for message `createdAt`
    fn wall(&self) -> OffsetDateTime;
}

/// Real clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    wall_base: OffsetDateTime,
    elapsed_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(wall_base: OffsetDateTime) -> Self {
        Self {
            base: Instant::now(),
            wall_base,
            elapsed_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move both clocks forward
    pub fn advance(&self, by: Duration) {
        self.elapsed_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn wall(&self) -> OffsetDateTime {
        self.wall_base + self.elapsed()
    }
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;
