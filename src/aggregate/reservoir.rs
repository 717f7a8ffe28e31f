// =============================================================================
// Latency Reservoir — fixed-size Algorithm R sampler with percentile reads
// =============================================================================
//
// Bounds per-endpoint latency memory to a fixed sample count while keeping
// p50/p95/p99 estimation error within ~2 percentile points under stationary
// load. Every incoming latency is offered; once the reservoir is full each
// new value replaces a uniformly random slot with probability capacity/seen.
// =============================================================================

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Default reservoir capacity for endpoint aggregates.
pub const RESERVOIR_CAPACITY: usize = 1024;

/// Fixed-size uniform sample of observed latencies.
#[derive(Debug, Clone)]
pub struct Reservoir {
    samples: Vec<f64>,
    capacity: usize,
    /// Total values offered, including those not retained.
    seen: u64,
    rng: StdRng,
}

/// Percentile estimates read from a reservoir (or a merge of reservoirs).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic construction for tests.
    #[cfg(test)]
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offer one value. Retention follows Algorithm R: the i-th value is kept
    /// with probability capacity/i once the reservoir is full.
    pub fn offer(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let j = self.rng.gen_range(0..self.seen);
        if (j as usize) < self.capacity {
            self.samples[j as usize] = value;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Current sample set (unordered). Cloned out for archive blobs and
    /// cross-hour percentile merges.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Arithmetic mean of the retained samples.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// p50/p95/p99 of the retained samples.
    pub fn percentiles(&self) -> Option<Percentiles> {
        percentiles_of(&self.samples)
    }

    /// Drop all samples and reset the offer count.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.seen = 0;
    }
}

/// Nearest-rank percentiles over an arbitrary sample slice. Used directly by
/// analytics when merging archived reservoirs across hours.
pub fn percentiles_of(samples: &[f64]) -> Option<Percentiles> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = |p: f64| -> f64 {
        let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[idx.clamp(1, sorted.len()) - 1]
    };

    Some(Percentiles {
        p50: rank(50.0),
        p95: rank(95.0),
        p99: rank(99.0),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_up_to_capacity_verbatim() {
        let mut r = Reservoir::with_seed(8, 42);
        for i in 0..8 {
            r.offer(i as f64);
        }
        assert_eq!(r.len(), 8);
        assert_eq!(r.seen(), 8);
        let mut samples = r.samples().to_vec();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(samples, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut r = Reservoir::with_seed(16, 7);
        for i in 0..10_000 {
            r.offer(i as f64);
        }
        assert_eq!(r.len(), 16);
        assert_eq!(r.seen(), 10_000);
    }

    #[test]
    fn mean_of_partial_fill() {
        let mut r = Reservoir::with_seed(1024, 1);
        for v in [10.0, 20.0, 30.0] {
            r.offer(v);
        }
        assert!((r.mean().unwrap() - 20.0).abs() < f64::EPSILON);
        assert!(Reservoir::with_seed(4, 1).mean().is_none());
    }

    #[test]
    fn uniform_percentiles_are_close() {
        // 10k uniform samples on [0, 1000): p50 ~ 500, p95 ~ 950, p99 ~ 990.
        let mut r = Reservoir::with_seed(1024, 99);
        for i in 0..10_000u32 {
            // Low-discrepancy sweep over [0, 1000).
            let v = f64::from(i % 1000) + f64::from(i / 1000) / 10.0;
            r.offer(v);
        }
        let p = r.percentiles().unwrap();
        assert!((p.p50 - 500.0).abs() < 40.0, "p50 = {}", p.p50);
        assert!((p.p95 - 950.0).abs() < 40.0, "p95 = {}", p.p95);
        assert!((p.p99 - 990.0).abs() < 40.0, "p99 = {}", p.p99);
    }

    #[test]
    fn nearest_rank_on_small_sets() {
        let p = percentiles_of(&[5.0]).unwrap();
        assert_eq!(p.p50, 5.0);
        assert_eq!(p.p99, 5.0);

        let p = percentiles_of(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(p.p50, 2.0);
        assert_eq!(p.p99, 4.0);

        assert!(percentiles_of(&[]).is_none());
    }

    #[test]
    fn reset_clears_state() {
        let mut r = Reservoir::with_seed(8, 3);
        for i in 0..100 {
            r.offer(i as f64);
        }
        r.reset();
        assert!(r.is_empty());
        assert_eq!(r.seen(), 0);
        assert!(r.percentiles().is_none());
    }
}
