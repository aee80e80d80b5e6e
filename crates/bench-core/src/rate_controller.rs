use crate::clock::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Yields timed during calibration.
pub const CALIBRATION_YIELDS: u32 = 1000;

const MIN_WINDOW_SECS: f64 = 0.75;
const MAX_WINDOW_SECS: f64 = 1.25;
const MIN_YIELD_SECS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Busy-wait pacer that holds a caller to a target messages/second by
/// yielding the processor a self-correcting number of times per message.
///
/// Each adjustment window is sized to one second worth of yields at the
/// current estimate; the window's real duration (clamped to 0.75..1.25 s)
/// rescales yields-per-message, so the rate converges whatever a yield
/// actually costs on the host.
pub struct RateController {
    clock: Arc<dyn Clock>,
    state: PacingState,
    rate: f64,
    yields_per_message: f64,
    yields_per_second: f64,
    yield_count: f64,
    message_count: f64,
    last_adjust: Duration,
}

impl RateController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: PacingState::Uninitialized,
            rate: 0.0,
            yields_per_message: 0.0,
            yields_per_second: 0.0,
            yield_count: 0.0,
            message_count: 0.0,
            last_adjust: Duration::ZERO,
        }
    }

    /// Times [`CALIBRATION_YIELDS`] yields and derives the starting
    /// yields-per-message for `rate`. Also used for runtime rate changes.
    /// A rate of zero or less turns pacing off.
    pub fn calibrate(&mut self, rate: f64) {
        let start = self.clock.now();
        for _ in 0..CALIBRATION_YIELDS {
            self.clock.yield_now();
        }
        let end = self.clock.now();
        let per_yield = (end.saturating_sub(start).as_secs_f64() / CALIBRATION_YIELDS as f64)
            .max(MIN_YIELD_SECS);

        self.rate = rate;
        self.yields_per_message = if rate > 0.0 {
            1.0 / (per_yield * rate)
        } else {
            0.0
        };
        // Zero forces an adjustment on the first pace() instead of a burst.
        self.yields_per_second = 0.0;
        self.yield_count = 0.0;
        self.message_count = 0.0;
        self.last_adjust = end;
        self.state = PacingState::Initialized;

        debug!(
            rate,
            per_yield_ns = per_yield * 1e9,
            yields_per_message = self.yields_per_message,
            "rate controller calibrated"
        );
    }

    /// Called once before every message.
    pub fn pace(&mut self) {
        match self.state {
            PacingState::Uninitialized | PacingState::Stopped => return,
            PacingState::Initialized | PacingState::Running => {}
        }
        if self.rate <= 0.0 {
            return;
        }
        self.state = PacingState::Running;

        if self.yield_count >= self.yields_per_second {
            let now = self.clock.now();
            let elapsed = now
                .saturating_sub(self.last_adjust)
                .as_secs_f64()
                .clamp(MIN_WINDOW_SECS, MAX_WINDOW_SECS);
            self.yields_per_message /= elapsed;
            self.yields_per_second = self.yields_per_message * self.rate;
            self.yield_count = 0.0;
            self.message_count = 0.0;
            self.last_adjust = now;
        }

        self.message_count += self.yields_per_message;
        while self.yield_count < self.message_count {
            self.yield_count += 1.0;
            self.clock.yield_now();
        }
    }

    pub fn stop(&mut self) {
        self.state = PacingState::Stopped;
    }

    pub fn state(&self) -> PacingState {
        self.state
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn yields_per_message(&self) -> f64 {
        self.yields_per_message
    }
}

/// Global target rate shared by every pacer of a run. Changing it bumps the
/// generation so pacers re-calibrate without restarting threads.
#[derive(Debug)]
pub struct RateTarget {
    rate: AtomicU64,
    generation: AtomicU64,
}

impl RateTarget {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            generation: AtomicU64::new(0),
        }
    }

    pub fn set(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Tokens made available to one producer by the shared controller thread.
/// Stored as `f64` bits; only the feeder thread writes it.
#[derive(Debug, Default)]
pub struct TokenGate {
    tokens_in: AtomicU64,
}

impl TokenGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn available(&self) -> f64 {
        f64::from_bits(self.tokens_in.load(Ordering::Acquire))
    }

    fn add(&self, tokens: f64) {
        let current = self.available();
        self.tokens_in
            .store((current + tokens).to_bits(), Ordering::Release);
    }
}

/// Producer side of a [`TokenGate`]: spins until a token is available.
pub struct TokenTap {
    gate: Arc<TokenGate>,
    consumed: f64,
    clock: Arc<dyn Clock>,
}

impl TokenTap {
    pub fn new(gate: Arc<TokenGate>, clock: Arc<dyn Clock>) -> Self {
        Self {
            gate,
            consumed: 0.0,
            clock,
        }
    }

    /// Returns false if `done` fired while waiting.
    pub fn take(&mut self, done: &AtomicBool) -> bool {
        while self.gate.available() <= self.consumed {
            if done.load(Ordering::Relaxed) {
                return false;
            }
            self.clock.yield_now();
        }
        self.consumed += 1.0;
        true
    }

    pub fn consumed(&self) -> f64 {
        self.consumed
    }
}

/// The shared controller: paces itself at `batch_rate` ticks per second and
/// on every tick drips `per_thread_rate / batch_rate` tokens into each
/// producer's gate.
pub struct TokenFeeder {
    controller: RateController,
    target: Arc<RateTarget>,
    gates: Vec<Arc<TokenGate>>,
    batch_rate: f64,
    batch_factor: f64,
    seen_generation: u64,
}

impl TokenFeeder {
    pub fn new(
        clock: Arc<dyn Clock>,
        target: Arc<RateTarget>,
        gates: Vec<Arc<TokenGate>>,
        batch_rate: f64,
    ) -> Self {
        let seen_generation = target.generation();
        let mut feeder = Self {
            controller: RateController::new(clock),
            target,
            gates,
            batch_rate,
            batch_factor: 0.0,
            seen_generation,
        };
        feeder.recalibrate();
        feeder
    }

    fn recalibrate(&mut self) {
        let producers = self.gates.len().max(1) as f64;
        let per_thread = self.target.rate() as f64 / producers;
        self.controller.calibrate(self.batch_rate);
        self.batch_factor = per_thread / self.batch_rate;
    }

    pub fn tick(&mut self) {
        let generation = self.target.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.recalibrate();
        }
        self.controller.pace();
        for gate in &self.gates {
            gate.add(self.batch_factor);
        }
    }

    pub fn run(mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.tick();
        }
        self.controller.stop();
    }

    pub fn batch_factor(&self) -> f64 {
        self.batch_factor
    }
}

/// How a producer waits before each send.
pub enum Pacing {
    Unpaced,
    PerThread {
        controller: RateController,
        target: Arc<RateTarget>,
        producers: usize,
        seen_generation: u64,
    },
    Shared(TokenTap),
}

impl Pacing {
    pub fn per_thread(clock: Arc<dyn Clock>, target: Arc<RateTarget>, producers: usize) -> Self {
        let producers = producers.max(1);
        let mut controller = RateController::new(clock);
        controller.calibrate(target.rate() as f64 / producers as f64);
        Pacing::PerThread {
            controller,
            seen_generation: target.generation(),
            target,
            producers,
        }
    }

    /// Blocks until the next send is allowed. Returns false if `done` fired.
    pub fn wait(&mut self, done: &AtomicBool) -> bool {
        match self {
            Pacing::Unpaced => true,
            Pacing::PerThread {
                controller,
                target,
                producers,
                seen_generation,
            } => {
                let generation = target.generation();
                if generation != *seen_generation {
                    *seen_generation = generation;
                    controller.calibrate(target.rate() as f64 / *producers as f64);
                }
                controller.pace();
                !done.load(Ordering::Relaxed)
            }
            Pacing::Shared(tap) => tap.take(done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const SEND_COST: Duration = Duration::from_micros(5);

    /// Paces simulated sends until `until` and returns how many went out.
    fn send_until(ctl: &mut RateController, clock: &ManualClock, until: Duration) -> u64 {
        let mut sent = 0;
        while clock.now() < until {
            ctl.pace();
            clock.advance(SEND_COST);
            sent += 1;
        }
        sent
    }

    #[test]
    fn test_state_transitions() {
        let clock = Arc::new(ManualClock::new(Duration::from_micros(1)));
        let mut ctl = RateController::new(clock.clone());
        assert_eq!(ctl.state(), PacingState::Uninitialized);

        ctl.calibrate(1000.0);
        assert_eq!(ctl.state(), PacingState::Initialized);
        assert!((ctl.yields_per_message() - 1000.0).abs() < 1e-6);

        ctl.pace();
        assert_eq!(ctl.state(), PacingState::Running);

        ctl.stop();
        let before = clock.now();
        ctl.pace();
        assert_eq!(ctl.state(), PacingState::Stopped);
        assert_eq!(clock.now(), before);
    }

    #[test]
    fn test_converges_to_target() {
        let clock = Arc::new(ManualClock::new(Duration::from_micros(10)));
        let mut ctl = RateController::new(clock.clone());
        ctl.calibrate(1000.0);

        let warm_up_end = clock.now() + Duration::from_secs(5);
        send_until(&mut ctl, &clock, warm_up_end);

        let sent = send_until(&mut ctl, &clock, warm_up_end + Duration::from_secs(20));
        let rate = sent as f64 / 20.0;
        assert!((900.0..=1100.0).contains(&rate), "rate: {}", rate);
    }

    #[test]
    fn test_recalibrate_for_new_rate() {
        let clock = Arc::new(ManualClock::new(Duration::from_micros(10)));
        let mut ctl = RateController::new(clock.clone());
        ctl.calibrate(1000.0);
        send_until(&mut ctl, &clock, clock.now() + Duration::from_secs(3));

        ctl.calibrate(2000.0);
        let warm_up_end = clock.now() + Duration::from_secs(5);
        send_until(&mut ctl, &clock, warm_up_end);
        let sent = send_until(&mut ctl, &clock, warm_up_end + Duration::from_secs(10));
        let rate = sent as f64 / 10.0;
        assert!((1800.0..=2200.0).contains(&rate), "rate: {}", rate);
    }

    #[test]
    fn test_zero_rate_does_not_pace() {
        let clock = Arc::new(ManualClock::new(Duration::from_micros(10)));
        let mut ctl = RateController::new(clock.clone());
        ctl.calibrate(0.0);
        let before = clock.now();
        for _ in 0..100 {
            ctl.pace();
        }
        assert_eq!(clock.now(), before);
    }

    #[test]
    fn test_rate_target_generation() {
        let target = RateTarget::new(500);
        assert_eq!(target.generation(), 0);
        target.set(800);
        assert_eq!(target.rate(), 800);
        assert_eq!(target.generation(), 1);
    }

    #[test]
    fn test_token_tap_waits_for_tokens() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Duration::from_micros(1)));
        let gate = Arc::new(TokenGate::new());
        gate.add(2.5);
        let mut tap = TokenTap::new(gate.clone(), clock);
        let done = AtomicBool::new(true);

        assert!(tap.take(&done));
        assert!(tap.take(&done));
        assert!(tap.take(&done));
        assert!(!tap.take(&done), "only 2.5 tokens were available");
        assert_eq!(tap.consumed(), 3.0);
    }

    #[test]
    fn test_feeder_drips_per_thread_rate() {
        let clock = Arc::new(ManualClock::new(Duration::from_micros(10)));
        let target = Arc::new(RateTarget::new(4000));
        let gates: Vec<_> = (0..4).map(|_| Arc::new(TokenGate::new())).collect();
        let mut feeder = TokenFeeder::new(clock.clone(), target.clone(), gates.clone(), 100.0);
        assert!((feeder.batch_factor() - 10.0).abs() < 1e-9);

        let warm_up_end = clock.now() + Duration::from_secs(5);
        while clock.now() < warm_up_end {
            feeder.tick();
        }
        let start_tokens = gates[0].available();
        let measure_end = warm_up_end + Duration::from_secs(10);
        while clock.now() < measure_end {
            feeder.tick();
        }
        let per_sec = (gates[0].available() - start_tokens) / 10.0;
        assert!((900.0..=1100.0).contains(&per_sec), "tokens/sec: {}", per_sec);
        assert_eq!(gates[1].available(), gates[0].available());

        target.set(8000);
        feeder.tick();
        assert!((feeder.batch_factor() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_pacing_per_thread_picks_up_rate_change() {
        let clock = Arc::new(ManualClock::new(Duration::from_micros(10)));
        let target = Arc::new(RateTarget::new(2000));
        let mut pacing = Pacing::per_thread(clock.clone(), target.clone(), 2);
        let done = AtomicBool::new(false);
        assert!(pacing.wait(&done));

        target.set(4000);
        assert!(pacing.wait(&done));
        match &pacing {
            Pacing::PerThread { controller, .. } => assert_eq!(controller.rate(), 2000.0),
            _ => panic!("expected per-thread pacing"),
        }
    }
}
