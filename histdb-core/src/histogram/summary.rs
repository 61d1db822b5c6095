//! Read-side summaries over a histogram's buckets

use super::{Bucket, HistogramStore, LEAF_WIDTH};
use crate::arena::Handle;
use serde::Serialize;
use std::ops::ControlFlow;

/// Count, mean and variance of a histogram, computed from bucket
/// representatives
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total: u64,
    pub sum: f64,
    pub mean: f64,
    pub variance: f64,
}

#[inline]
fn sum_leaf(counts: &[u64; LEAF_WIDTH]) -> u64 {
    let mut lanes = [0u64; 8];
    for chunk in counts.chunks_exact(8) {
        for (lane, c) in lanes.iter_mut().zip(chunk) {
            *lane = lane.wrapping_add(*c);
        }
    }
    lanes.iter().fold(0u64, |acc, l| acc.wrapping_add(*l))
}

impl HistogramStore {
    /// Number of observations
    pub fn total(&self, h: Handle) -> u64 {
        let mut total = 0u64;
        self.visit_leaves(h, true, |_, _, counts| {
            total = total.wrapping_add(sum_leaf(counts));
            ControlFlow::Continue(())
        });
        total
    }

    fn first_bucket(&self, h: Handle, ascending: bool) -> Option<Bucket> {
        let mut found = None;
        self.for_each_bucket(h, ascending, |b, _| {
            found = Some(b);
            ControlFlow::Break(())
        });
        found
    }

    /// Representative of the lowest non-empty bucket
    pub fn min(&self, h: Handle) -> Option<f32> {
        self.first_bucket(h, true).map(|b| b.representative())
    }

    /// Representative of the highest non-empty bucket
    pub fn max(&self, h: Handle) -> Option<f32> {
        self.first_bucket(h, false).map(|b| b.representative())
    }

    /// Representative of the bucket holding the `q`-quantile
    pub fn quantile(&self, h: Handle, q: f64) -> Option<f32> {
        let total = self.total(h);
        if total == 0 {
            return None;
        }
        let target = ((q.clamp(0.0, 1.0) * total as f64 + 0.5) as u64).max(1);
        let mut acc = 0u64;
        let mut found = None;
        self.for_each_bucket(h, true, |b, c| {
            acc += c;
            if acc >= target {
                found = Some(b.representative());
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        found
    }

    /// Approximate number of observations `<= v`. Observations sharing `v`'s
    /// bucket count half.
    pub fn cdf(&self, h: Handle, v: f32) -> f64 {
        if v.is_nan() {
            return 0.0;
        }
        if v == f32::INFINITY {
            return self.total(h) as f64;
        }
        if v == f32::NEG_INFINITY {
            return 0.0;
        }
        let probe = Bucket::of(v);
        let mut below = 0u64;
        let mut equal = 0u64;
        self.for_each_bucket(h, true, |b, c| {
            if b < probe {
                below += c;
                ControlFlow::Continue(())
            } else {
                if b == probe {
                    equal = c;
                }
                ControlFlow::Break(())
            }
        });
        below as f64 + equal as f64 / 2.0
    }

    /// Weighted running mean and variance over bucket representatives
    pub fn summary(&self, h: Handle) -> Summary {
        let mut s = Summary::default();
        let mut m2 = 0.0f64;
        self.for_each_bucket(h, true, |b, c| {
            let x = b.representative() as f64;
            let w = c as f64;
            s.total += c;
            s.sum += x * w;
            let n = s.total as f64;
            let delta = x - s.mean;
            s.mean += delta * w / n;
            m2 += w * delta * (x - s.mean);
            ControlFlow::Continue(())
        });
        if s.total > 0 {
            s.variance = m2 / s.total as f64;
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() <= b.abs() * 0.01 + 1e-6
    }

    #[test]
    fn test_empty_histogram() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        assert_eq!(store.total(h), 0);
        assert_eq!(store.min(h), None);
        assert_eq!(store.max(h), None);
        assert_eq!(store.quantile(h, 0.5), None);
        assert_eq!(store.cdf(h, 1.0), 0.0);
        assert_eq!(store.summary(h), Summary::default());
    }

    #[test]
    fn test_uniform_quantiles() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        for i in 1..=1000 {
            store.observe(h, i as f32);
        }
        assert_eq!(store.total(h), 1000);
        assert!(approx(store.min(h).unwrap(), 1.0));
        assert!(approx(store.max(h).unwrap(), 1000.0));
        assert!(approx(store.quantile(h, 0.5).unwrap(), 500.0));
        assert!(approx(store.quantile(h, 0.9).unwrap(), 900.0));
        assert!(approx(store.quantile(h, 0.99).unwrap(), 990.0));
        assert!(approx(store.quantile(h, 0.0).unwrap(), 1.0));
    }

    #[test]
    fn test_negative_values_order() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        for v in [-100.0f32, -1.0, 0.0, 1.0, 100.0] {
            store.observe(h, v);
        }
        assert!(approx(store.min(h).unwrap(), -100.0));
        assert!(approx(store.max(h).unwrap(), 100.0));
        assert!(store.quantile(h, 0.5).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cdf_counts_half_of_equal_bucket() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        for _ in 0..10 {
            store.observe(h, 1.0);
        }
        for _ in 0..4 {
            store.observe(h, 50.0);
        }
        assert_eq!(store.cdf(h, 0.5), 0.0);
        assert_eq!(store.cdf(h, 1.0), 5.0);
        assert_eq!(store.cdf(h, 10.0), 10.0);
        assert_eq!(store.cdf(h, 50.0), 12.0);
        assert_eq!(store.cdf(h, f32::INFINITY), 14.0);
    }

    #[test]
    fn test_summary_statistics() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        for _ in 0..3 {
            store.observe(h, 2.0);
        }
        for _ in 0..3 {
            store.observe(h, 4.0);
        }
        let s = store.summary(h);
        let lo = Bucket::of(2.0).representative() as f64;
        let hi = Bucket::of(4.0).representative() as f64;
        assert_eq!(s.total, 6);
        assert!((s.mean - (lo + hi) / 2.0).abs() < 1e-9);
        assert!((s.variance - ((hi - lo) / 2.0).powi(2)).abs() < 1e-9);
        assert!((s.sum - 3.0 * (lo + hi)).abs() < 1e-9);
    }
}
