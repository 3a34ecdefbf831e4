use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic millisecond clock. Abstracted so rate-limited paths (the
/// drop-queue gate, the size-storer sync tracker) can be driven forward
/// deterministically in tests.
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicU64::new(0),
        }
    }

    pub fn advance_millis(&self, delta: u64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Fires when either an operation budget or a time period has elapsed since
/// the last reset. Used to pace opportunistic size-storer syncs.
pub struct PeriodicTracker {
    clock: Arc<dyn ClockSource>,
    op_limit: u64,
    period_millis: u64,
    ops: AtomicU64,
    last_reset: AtomicU64,
}

impl PeriodicTracker {
    pub fn new(clock: Arc<dyn ClockSource>, op_limit: u64, period_millis: u64) -> Self {
        let now = clock.now_millis();
        Self {
            clock,
            op_limit,
            period_millis,
            ops: AtomicU64::new(0),
            last_reset: AtomicU64::new(now),
        }
    }

    pub fn note_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interval_elapsed(&self) -> bool {
        if self.ops.load(Ordering::Relaxed) >= self.op_limit {
            return true;
        }
        let now = self.clock.now_millis();
        now.saturating_sub(self.last_reset.load(Ordering::Relaxed)) >= self.period_millis
    }

    pub fn reset(&self) {
        self.ops.store(0, Ordering::Relaxed);
        self.last_reset
            .store(self.clock.now_millis(), Ordering::Relaxed);
    }
}
