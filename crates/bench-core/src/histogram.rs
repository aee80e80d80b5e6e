use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of latency buckets; samples at or above this land in overflow.
pub const MAX_LATENCY: usize = 30_000;

/// Fixed-size latency histogram indexed by integer latency units.
///
/// Memory is one counter per bucket regardless of how long the run lasts.
/// `record` is O(1), `percentile` is O(buckets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: Vec<u64>,
    overflow: u64,
    min: u64,
    max: u64,
    max_seq: u64,
}

impl Histogram {
    pub fn new(size: usize) -> Self {
        Self {
            buckets: vec![0; size.max(1)],
            overflow: 0,
            min: u64::MAX,
            max: 0,
            max_seq: 0,
        }
    }

    pub fn record(&mut self, latency: u64) {
        self.record_with_seq(latency, 0);
    }

    /// Records one sample. `seq` identifies the sample that produced the
    /// current maximum, for worst-case diagnostics.
    pub fn record_with_seq(&mut self, latency: u64, seq: u64) {
        let first = !self.max_recorded();
        match self.buckets.get_mut(latency as usize) {
            Some(bucket) => *bucket += 1,
            None => self.overflow += 1,
        }
        if latency < self.min {
            self.min = latency;
        }
        if first || latency > self.max {
            self.max = latency;
            self.max_seq = seq;
        }
    }

    /// Pointwise addition of `other` into `self`. Extremes are left alone;
    /// use [`Histogram::merge_extremes`] for those.
    pub fn merge(&mut self, other: &Histogram) {
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += *theirs;
        }
        self.overflow += other.overflow;
    }

    pub fn merge_extremes(&mut self, other: &Histogram) {
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max_recorded() && (!self.max_recorded() || other.max > self.max) {
            self.max = other.max;
            self.max_seq = other.max_seq;
        }
    }

    fn max_recorded(&self) -> bool {
        self.min != u64::MAX
    }

    /// Latency below which `p` (0..1) of the samples fall.
    ///
    /// Returns 0 for an empty histogram and the bucket count when the
    /// target rank lands in the overflow counter.
    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let target = ((p * total as f64).floor() as u64).max(1);
        let mut running = 0u64;
        for (idx, &count) in self.buckets.iter().enumerate() {
            let before = running;
            running += count;
            if before < target && target <= running {
                return idx as u64;
            }
        }
        self.buckets.len() as u64
    }

    /// Average latency. Overflowed samples count at the histogram bound.
    pub fn mean(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .buckets
            .iter()
            .enumerate()
            .map(|(idx, &count)| idx as f64 * count as f64)
            .sum::<f64>()
            + self.overflow as f64 * self.buckets.len() as f64;
        sum / total as f64
    }

    pub fn stddev(&self) -> f64 {
        let total = self.total();
        if total < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let bound = self.buckets.len() as f64;
        let squares: f64 = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(idx, &count)| (idx as f64 - mean).powi(2) * count as f64)
            .sum::<f64>()
            + (bound - mean).powi(2) * self.overflow as f64;
        (squares / total as f64).sqrt()
    }

    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
        self.overflow = 0;
        self.min = u64::MAX;
        self.max = 0;
        self.max_seq = 0;
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum::<u64>() + self.overflow
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn count_at(&self, latency: usize) -> u64 {
        self.buckets.get(latency).copied().unwrap_or(0)
    }

    pub fn min(&self) -> Option<u64> {
        self.max_recorded().then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        self.max_recorded().then_some(self.max)
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// Non-empty buckets only, for result files.
    pub fn to_sparse(&self) -> SparseHistogram {
        SparseHistogram {
            size: self.buckets.len(),
            buckets: self
                .buckets
                .iter()
                .enumerate()
                .filter(|(_, &count)| count > 0)
                .map(|(idx, &count)| (idx as u64, count))
                .collect(),
            overflow: self.overflow,
            min: self.min(),
            max: self.max(),
            max_seq: self.max_seq,
        }
    }

    pub fn from_sparse(sparse: &SparseHistogram) -> Self {
        let mut hist = Self::new(sparse.size);
        for &(idx, count) in &sparse.buckets {
            match hist.buckets.get_mut(idx as usize) {
                Some(bucket) => *bucket += count,
                None => hist.overflow += count,
            }
        }
        hist.overflow += sparse.overflow;
        if let (Some(min), Some(max)) = (sparse.min, sparse.max) {
            hist.min = min;
            hist.max = max;
            hist.max_seq = sparse.max_seq;
        }
        hist
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(MAX_LATENCY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseHistogram {
    pub size: usize,
    pub buckets: Vec<(u64, u64)>,
    pub overflow: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    /// Sequence number of the maximum sample
    #[serde(default)]
    pub max_seq: u64,
}

/// Histogram written by worker (or client delivery) threads while the
/// aggregator copies it out. Buckets are relaxed atomics; a snapshot taken
/// mid-update may be off by the samples in flight.
#[derive(Debug)]
pub struct LiveHistogram {
    buckets: Box<[AtomicU64]>,
    overflow: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    max_seq: AtomicU64,
}

impl LiveHistogram {
    pub fn new(size: usize) -> Self {
        Self {
            buckets: (0..size.max(1)).map(|_| AtomicU64::new(0)).collect(),
            overflow: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            max_seq: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: u64, seq: u64) {
        match self.buckets.get(latency as usize) {
            Some(bucket) => bucket.fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.min.fetch_min(latency, Ordering::Relaxed);
        let prev = self.max.fetch_max(latency, Ordering::Relaxed);
        if latency >= prev {
            self.max_seq.store(seq, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Histogram {
        let mut hist = Histogram::new(self.buckets.len());
        for (dst, src) in hist.buckets.iter_mut().zip(self.buckets.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        hist.overflow = self.overflow.load(Ordering::Relaxed);
        hist.min = self.min.load(Ordering::Relaxed);
        hist.max = self.max.load(Ordering::Relaxed);
        hist.max_seq = self.max_seq.load(Ordering::Relaxed);
        hist
    }

    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
        self.overflow.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        self.max_seq.store(0, Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }
}
