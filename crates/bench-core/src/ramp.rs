use crate::config::RampStep;

/// Ordered schedule of global rate steps. Steps are applied strictly in
/// order using integer milliseconds and integer rates.
#[derive(Debug, Clone, Default)]
pub struct RampPlanner {
    steps: Vec<RampStep>,
}

impl RampPlanner {
    pub fn new(steps: Vec<RampStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[RampStep] {
        &self.steps
    }

    /// Total duration of all ramp steps in milliseconds.
    pub fn total_duration_ms(&self) -> u64 {
        self.steps.iter().map(|s| s.hold_ms).sum()
    }

    /// Index and rate of the step active `elapsed_ms` into the ramp.
    pub fn step_at(&self, elapsed_ms: u64) -> Option<(usize, u64)> {
        let mut cumulative_ms = 0u64;
        for (index, step) in self.steps.iter().enumerate() {
            if elapsed_ms < cumulative_ms + step.hold_ms {
                return Some((index, step.tps));
            }
            cumulative_ms += step.hold_ms;
        }
        None
    }

    pub fn cursor(self) -> RampCursor {
        RampCursor {
            planner: self,
            current: None,
        }
    }
}

/// Walks a ramp and reports each step only when it becomes active.
#[derive(Debug, Clone)]
pub struct RampCursor {
    planner: RampPlanner,
    current: Option<usize>,
}

impl RampCursor {
    /// Returns the new target rate when the active step changed.
    pub fn poll(&mut self, elapsed_ms: u64) -> Option<u64> {
        let (index, tps) = self.planner.step_at(elapsed_ms)?;
        if self.current == Some(index) {
            return None;
        }
        self.current = Some(index);
        Some(tps)
    }

    pub fn finished(&self, elapsed_ms: u64) -> bool {
        elapsed_ms >= self.planner.total_duration_ms()
    }
}
