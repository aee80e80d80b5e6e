use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source and scheduler-yield primitive used by the pacing code.
///
/// `now` is monotonic and measured from an arbitrary origin. `yield_now`
/// gives up the processor without sleeping; pacing busy-waits on it because
/// OS sleep granularity is too coarse above a few thousand messages/second.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn yield_now(&self);
}

#[derive(Debug, Clone)]
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

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Deterministic clock for tests: time only moves when told to, and every
/// yield costs a fixed simulated amount.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
    yield_cost_nanos: u64,
}

impl ManualClock {
    pub fn new(yield_cost: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(0),
            yield_cost_nanos: yield_cost.as_nanos() as u64,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }

    fn yield_now(&self) {
        self.nanos.fetch_add(self.yield_cost_nanos, Ordering::Relaxed);
    }
}

/// Nanoseconds since the Unix epoch, the timestamp carried in sampled frames.
/// Producers and consumers may live in different processes, so this is wall
/// clock time rather than `Instant`.
pub fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Converts a nanosecond interval into latency units (`units_per_sec` units
/// per second, 1e6 for microseconds).
pub fn to_units(nanos: u64, units_per_sec: f64) -> u64 {
    (nanos as f64 * units_per_sec / 1e9) as u64
}
