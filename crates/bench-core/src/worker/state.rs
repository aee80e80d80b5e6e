use crate::client::MessagingClient;
use crate::clock::{to_units, Clock};
use crate::config::{BenchConfig, LatencyCategory, Termination};
use crate::histogram::LiveHistogram;
use crate::rate_controller::RateTarget;
use crate::topology::{DestinationDescriptor, Role};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Run-wide state handed to every worker thread.
pub struct RunContext {
    pub config: BenchConfig,
    pub clock: Arc<dyn Clock>,
    pub client: Arc<dyn MessagingClient>,
    pub rate: Arc<RateTarget>,
    /// Global stop, set once by the supervisor
    pub stop: AtomicBool,
    pub connected_producers: AtomicUsize,
    pub num_producers: usize,
    pub units_per_sec: f64,
}

impl RunContext {
    pub fn new(config: BenchConfig, clock: Arc<dyn Clock>, client: Arc<dyn MessagingClient>) -> Self {
        let rate = Arc::new(RateTarget::new(config.rate.effective_rate()));
        let num_producers = config.producer_threads();
        let units_per_sec = config.latency.units_per_sec();
        Self {
            config,
            clock,
            client,
            rate,
            stop: AtomicBool::new(false),
            connected_producers: AtomicUsize::new(0),
            num_producers,
            units_per_sec,
        }
    }

    pub fn count_mode(&self) -> bool {
        self.config.run.termination == Termination::Count
    }

    pub fn per_destination(&self) -> u64 {
        self.config.run.messages_per_destination
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Runs `f`, recording its duration into `histogram` when one is given.
    pub fn timed<T>(&self, histogram: Option<&LiveHistogram>, f: impl FnOnce() -> T) -> T {
        let Some(histogram) = histogram else {
            return f();
        };
        let start = self.clock.now();
        let out = f();
        let elapsed = self.clock.now().saturating_sub(start);
        histogram.record(to_units(elapsed.as_nanos() as u64, self.units_per_sec), 0);
        out
    }

    /// Sleeps in short slices until `duration` passed or `done` fired.
    pub fn sleep_unless(&self, duration: Duration, done: &AtomicBool) {
        const SLICE: Duration = Duration::from_millis(10);
        let deadline = std::time::Instant::now() + duration;
        loop {
            if done.load(Ordering::Relaxed) || self.stopped() {
                return;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

/// Counters and flags of one worker thread. Written by the worker (and its
/// delivery callbacks), read by the aggregator, checker and supervisor.
pub struct WorkerShared {
    pub id: usize,
    pub label: String,
    pub role: Role,
    pub cpu: Option<usize>,
    pub destinations: Vec<DestinationDescriptor>,
    /// Messages expected per destination in count mode, 0 when the
    /// completion checker decides instead
    pub expected: Vec<u64>,
    count: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    done: AtomicBool,
    ready: AtomicBool,
    finished: AtomicBool,
    commit_interval: AtomicU32,
    calls: HashMap<LatencyCategory, LiveHistogram>,
    error: Mutex<Option<String>>,
}

impl WorkerShared {
    pub fn new(
        id: usize,
        role: Role,
        cpu: Option<usize>,
        destinations: Vec<DestinationDescriptor>,
        expected: Vec<u64>,
        commit_interval: u32,
        config: &BenchConfig,
    ) -> Self {
        let calls = LatencyCategory::ALL
            .into_iter()
            .filter(|c| *c != LatencyCategory::RoundTrip && config.latency.enabled(*c))
            .filter(|c| match role {
                Role::Producer => *c != LatencyCategory::Receive,
                Role::Consumer => *c != LatencyCategory::Send,
            })
            .map(|c| (c, LiveHistogram::new(config.latency.histogram_size)))
            .collect();
        Self {
            id,
            label: format!("{}{}", role.prefix(), id),
            role,
            cpu,
            destinations,
            expected,
            count: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            done: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            commit_interval: AtomicU32::new(commit_interval),
            calls,
            error: Mutex::new(None),
        }
    }

    pub fn add_count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Bumps the receive timeout counter and returns the new total.
    pub fn add_timeout(&self) -> u64 {
        self.timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn done_flag(&self) -> &AtomicBool {
        &self.done
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn commit_interval(&self) -> u32 {
        self.commit_interval.load(Ordering::Relaxed)
    }

    pub fn set_commit_interval(&self, interval: u32) {
        self.commit_interval.store(interval, Ordering::Relaxed);
    }

    pub fn call_histogram(&self, category: LatencyCategory) -> Option<&LiveHistogram> {
        self.calls.get(&category)
    }

    pub fn fail(&self, error: String) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.mark_done();
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// True once every destination of this worker reached its count.
    pub fn all_destinations_done(&self) -> bool {
        self.destinations.iter().all(|d| d.stats.is_done())
    }

    /// Messages this worker is expected to move in count mode.
    pub fn expected_total(&self, per_destination: u64) -> u64 {
        self.expected
            .iter()
            .map(|&e| if e == 0 { per_destination } else { e })
            .sum()
    }

    pub(crate) fn finish(&self) {
        self.mark_done();
        self.finished.store(true, Ordering::Release);
    }
}
