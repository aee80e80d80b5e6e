use crate::clock::Clock;
use crate::config::{LatencyCategory, LatencyConfig, RateMode};
use crate::histogram::{Histogram, SparseHistogram};
use crate::topology::Role;
use crate::worker::WorkerShared;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Summary statistics of one latency histogram, in latency units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub overflow: u64,
    pub min: u64,
    pub max: u64,
    /// Sequence number of the message that took `max`
    #[serde(default)]
    pub max_seq: u64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub p9999: u64,
    pub p99999: u64,
}

impl LatencySummary {
    pub fn from_histogram(hist: &Histogram) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        Self {
            samples: hist.total(),
            overflow: hist.overflow(),
            min: hist.min().unwrap_or(0),
            max: hist.max().unwrap_or(0),
            max_seq: hist.max_seq(),
            mean: hist.mean(),
            stddev: hist.stddev(),
            p50: hist.percentile(0.5),
            p95: hist.percentile(0.95),
            p99: hist.percentile(0.99),
            p999: hist.percentile(0.999),
            p9999: hist.percentile(0.9999),
            p99999: hist.percentile(0.99999),
        }
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.samples == 0 {
            return write!(f, "no samples");
        }
        write!(
            f,
            "n={} min={} max={} (seq {}) avg={:.1} std={:.1} p50={} p95={} p99={} p99.9={} p99.99={} p99.999={}",
            self.samples,
            self.min,
            self.max,
            self.max_seq,
            self.mean,
            self.stddev,
            self.p50,
            self.p95,
            self.p99,
            self.p999,
            self.p9999,
            self.p99999
        )?;
        if self.overflow > 0 {
            write!(f, " overflow={}", self.overflow)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationLatency {
    pub name: String,
    pub mean: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyReport {
    pub category: String,
    pub aggregate: LatencySummary,
    /// Per worker summaries, only filled when detail was requested
    pub threads: Vec<(String, LatencySummary)>,
    pub min_destination: Option<DestinationLatency>,
    pub max_destination: Option<DestinationLatency>,
    pub histogram: SparseHistogram,
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} latency: {}", self.category, self.aggregate)?;
        for (label, summary) in &self.threads {
            writeln!(f, "  {label}: {summary}")?;
        }
        if let Some(d) = &self.min_destination {
            writeln!(f, "  min avg destination {} avg={:.1} n={}", d.name, d.mean, d.samples)?;
        }
        if let Some(d) = &self.max_destination {
            writeln!(f, "  max avg destination {} avg={:.1} n={}", d.name, d.mean, d.samples)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRate {
    pub label: String,
    pub role: Role,
    pub count: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub elapsed_ms: u64,
    pub mode: RateMode,
    pub sent: u64,
    pub received: u64,
    pub send_rate: f64,
    pub receive_rate: f64,
    pub errors: u64,
    pub timeouts: u64,
    pub workers: Vec<WorkerRate>,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>8.1}s] sent={} ({:.0}/s) received={} ({:.0}/s) errors={} timeouts={}",
            self.elapsed_ms as f64 / 1000.0,
            self.sent,
            self.send_rate,
            self.received,
            self.receive_rate,
            self.errors,
            self.timeouts
        )
    }
}

struct Baseline {
    start: Duration,
    start_counts: Vec<u64>,
    last: Duration,
    last_counts: Vec<u64>,
}

/// Reads worker counters and histograms while the workers keep writing
/// them. Values are eventually consistent; a snapshot may miss messages in
/// flight.
pub struct Aggregator {
    clock: Arc<dyn Clock>,
    latency: LatencyConfig,
    workers: Vec<Arc<WorkerShared>>,
    baseline: Mutex<Baseline>,
}

impl Aggregator {
    pub fn new(clock: Arc<dyn Clock>, latency: LatencyConfig, workers: Vec<Arc<WorkerShared>>) -> Self {
        let now = clock.now();
        let counts: Vec<u64> = workers.iter().map(|w| w.count()).collect();
        Self {
            clock,
            latency,
            workers,
            baseline: Mutex::new(Baseline {
                start: now,
                start_counts: counts.clone(),
                last: now,
                last_counts: counts,
            }),
        }
    }

    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    pub fn totals(&self) -> (u64, u64) {
        self.workers.iter().fold((0, 0), |(sent, received), w| match w.role {
            Role::Producer => (sent + w.count(), received),
            Role::Consumer => (sent, received + w.count()),
        })
    }

    /// Per worker rates since the previous interval snapshot (`Interval`)
    /// or since the possibly reset start (`SinceStart`). Only interval
    /// snapshots move the interval baseline.
    pub fn snapshot(&self, mode: RateMode) -> Snapshot {
        let now = self.clock.now();
        let counts: Vec<u64> = self.workers.iter().map(|w| w.count()).collect();
        let mut baseline = self.baseline.lock();
        let (since, previous) = match mode {
            RateMode::Interval => (baseline.last, &baseline.last_counts),
            RateMode::SinceStart => (baseline.start, &baseline.start_counts),
        };
        let secs = now.saturating_sub(since).as_secs_f64();

        let mut snapshot = Snapshot {
            elapsed_ms: now.saturating_sub(baseline.start).as_millis() as u64,
            mode,
            sent: 0,
            received: 0,
            send_rate: 0.0,
            receive_rate: 0.0,
            errors: 0,
            timeouts: 0,
            workers: Vec::with_capacity(self.workers.len()),
        };
        for ((worker, &count), &before) in self.workers.iter().zip(&counts).zip(previous) {
            let rate = if secs > 0.0 {
                count.saturating_sub(before) as f64 / secs
            } else {
                0.0
            };
            match worker.role {
                Role::Producer => {
                    snapshot.sent += count;
                    snapshot.send_rate += rate;
                }
                Role::Consumer => {
                    snapshot.received += count;
                    snapshot.receive_rate += rate;
                }
            }
            snapshot.errors += worker.errors();
            snapshot.timeouts += worker.timeouts();
            snapshot.workers.push(WorkerRate {
                label: worker.label.clone(),
                role: worker.role,
                count,
                rate,
            });
        }
        if mode == RateMode::Interval {
            baseline.last = now;
            baseline.last_counts = counts;
        }
        snapshot
    }

    /// Moves the since-start baseline to now.
    pub fn reset_baseline(&self) {
        let now = self.clock.now();
        let counts: Vec<u64> = self.workers.iter().map(|w| w.count()).collect();
        let mut baseline = self.baseline.lock();
        baseline.start = now;
        baseline.start_counts = counts.clone();
        baseline.last = now;
        baseline.last_counts = counts;
    }

    pub fn reset_rtt(&self) {
        for worker in &self.workers {
            for descriptor in &worker.destinations {
                if let Some(rtt) = descriptor.stats.rtt() {
                    rtt.reset();
                }
            }
        }
    }

    pub fn reset_latency(&self) {
        self.reset_rtt();
        for worker in &self.workers {
            for category in LatencyCategory::ALL {
                if let Some(hist) = worker.call_histogram(category) {
                    hist.reset();
                }
            }
        }
    }

    /// Merges every histogram of `category` into one report. Returns `None`
    /// when the category is not being measured.
    pub fn latency_report(&self, category: LatencyCategory, detail: bool) -> Option<LatencyReport> {
        if !self.latency.enabled(category) {
            return None;
        }
        let size = self.latency.histogram_size;
        let mut aggregate = Histogram::new(size);
        let mut threads = Vec::new();
        let mut min_destination: Option<DestinationLatency> = None;
        let mut max_destination: Option<DestinationLatency> = None;
        let mut measured = false;

        for worker in &self.workers {
            let mut per_thread = Histogram::new(size);
            let mut has_data = false;
            if category == LatencyCategory::RoundTrip {
                for descriptor in &worker.destinations {
                    let Some(hist) = descriptor.stats.rtt_snapshot() else {
                        continue;
                    };
                    has_data = true;
                    per_thread.merge(&hist);
                    per_thread.merge_extremes(&hist);
                    if hist.is_empty() {
                        continue;
                    }
                    let entry = DestinationLatency {
                        name: descriptor.name.clone(),
                        mean: hist.mean(),
                        samples: hist.total(),
                    };
                    if min_destination.as_ref().map_or(true, |m| entry.mean < m.mean) {
                        min_destination = Some(entry.clone());
                    }
                    if max_destination.as_ref().map_or(true, |m| entry.mean > m.mean) {
                        max_destination = Some(entry);
                    }
                }
            } else if let Some(live) = worker.call_histogram(category) {
                has_data = true;
                per_thread = live.snapshot();
            }
            if !has_data {
                continue;
            }
            measured = true;
            aggregate.merge(&per_thread);
            aggregate.merge_extremes(&per_thread);
            if detail {
                threads.push((worker.label.clone(), LatencySummary::from_histogram(&per_thread)));
            }
        }
        if !measured {
            return None;
        }
        let extremes = category == LatencyCategory::RoundTrip && self.latency.report_extremes();
        Some(LatencyReport {
            category: category.label().to_string(),
            aggregate: LatencySummary::from_histogram(&aggregate),
            threads,
            min_destination: min_destination.filter(|_| extremes),
            max_destination: max_destination.filter(|_| extremes),
            histogram: aggregate.to_sparse(),
        })
    }

    /// Reports for every enabled category.
    pub fn latency_reports(&self, detail: bool) -> Vec<LatencyReport> {
        LatencyCategory::ALL
            .into_iter()
            .filter_map(|category| self.latency_report(category, detail))
            .collect()
    }
}
