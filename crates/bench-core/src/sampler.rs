use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

const MIN_WINDOW_SECS: f64 = 0.75;
const MAX_WINDOW_SECS: f64 = 1.25;

/// Picks which outgoing messages carry a round-trip timestamp so that about
/// `samples_per_sec` are selected each second whatever the real send rate.
///
/// One sampler per producer thread; it is not synchronised.
pub struct MessageSampler {
    clock: Arc<dyn Clock>,
    samples_per_sec: f64,
    select_ratio: f64,
    message_count: f64,
    selected: f64,
    last_adjust: Duration,
}

impl MessageSampler {
    pub fn new(clock: Arc<dyn Clock>, samples_per_sec: f64, estimated_rate: f64) -> Self {
        let select_ratio = if samples_per_sec <= 0.0 || estimated_rate <= 0.0 {
            1.0
        } else {
            (samples_per_sec / estimated_rate).min(1.0)
        };
        let last_adjust = clock.now();
        Self {
            clock,
            samples_per_sec,
            select_ratio,
            message_count: 0.0,
            selected: 0.0,
            last_adjust,
        }
    }

    /// Called once per outgoing message.
    pub fn should_sample(&mut self) -> bool {
        if self.samples_per_sec <= 0.0 {
            return true;
        }

        if self.selected >= self.samples_per_sec {
            let now = self.clock.now();
            let elapsed = now
                .saturating_sub(self.last_adjust)
                .as_secs_f64()
                .clamp(MIN_WINDOW_SECS, MAX_WINDOW_SECS);
            self.select_ratio = (self.select_ratio * elapsed).min(1.0);
            self.selected -= self.samples_per_sec;
            self.message_count -= self.samples_per_sec;
            self.last_adjust = now;
        }

        self.message_count += self.select_ratio;
        if self.selected < self.message_count {
            self.selected += 1.0;
            true
        } else {
            false
        }
    }

    pub fn select_ratio(&self) -> f64 {
        self.select_ratio
    }
}
