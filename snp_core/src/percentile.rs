//! Reservoir-sampling percentile generator: `PercentileGenerator<T, N>`.
//!
//! Feeds samples from an unbounded observation stream into a fixed-size
//! reservoir using Algorithm R, producing an unbiased uniform sub-sample
//! of the entire history. Percentiles are computed on demand from a
//! sorted copy, guarded by a dirty flag rather than keeping the buffer
//! sorted on every insert.

use rand::Rng;

/// A reservoir sampler over `N` slots of `T`. Construct with
/// `PercentileGenerator::new(capacity)`.
pub struct PercentileGenerator<T> {
    capacity: usize,
    reservoir: Vec<T>,
    total_seen: u64,
    dirty: bool,
}

impl<T: Copy + PartialOrd> PercentileGenerator<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, reservoir: Vec::with_capacity(capacity), total_seen: 0, dirty: false }
    }

    pub fn len(&self) -> usize {
        self.reservoir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservoir.is_empty()
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen
    }

    /// Adds one observation. If the reservoir is not yet full, the sample
    /// is appended; otherwise it replaces a uniformly-chosen existing slot
    /// with probability `capacity / total_seen`.
    pub fn add_sample(&mut self, value: T) {
        self.total_seen += 1;
        if self.reservoir.len() < self.capacity {
            self.reservoir.push(value);
            self.dirty = true;
            return;
        }
        let j = rand::thread_rng().gen_range(0..self.total_seen);
        if (j as usize) < self.capacity {
            self.reservoir[j as usize] = value;
            self.dirty = true;
        }
    }

    fn sorted(&mut self) -> &[T] {
        if self.dirty {
            self.reservoir.sort_by(|a, b| a.partial_cmp(b).expect("NaN samples are not supported"));
            self.dirty = false;
        }
        &self.reservoir
    }

    /// Returns the `p`-th percentile (0.0..=1.0) of the reservoir, or
    /// `None` if fewer than `ceil(1/p)` samples have been observed (the
    /// "not available" sentinel), with a floor of 20 samples for any
    /// non-trivial percentile query as used by the lifetime stats layer.
    pub fn percentile(&mut self, p: f64) -> Option<T> {
        debug_assert!((0.0..=1.0).contains(&p));
        let min_samples = (1.0 / p.max(f64::EPSILON)).ceil().max(1.0) as usize;
        let min_samples = min_samples.max(if p > 0.0 && p < 1.0 { 20.min(min_samples.max(1)) } else { 1 });
        if self.reservoir.len() < min_samples.min(self.capacity) || self.reservoir.is_empty() {
            return None;
        }
        let data = self.sorted();
        let idx = ((data.len() as f64 - 1.0) * p).round() as usize;
        Some(data[idx.min(data.len() - 1)])
    }

    pub fn min(&mut self) -> Option<T> {
        self.sorted().first().copied()
    }

    pub fn max(&mut self) -> Option<T> {
        self.sorted().last().copied()
    }
}
