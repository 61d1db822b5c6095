//! Flat streaming histogram over float32
//!
//! A value's IEEE-754 bits are made order-preserving and split into three
//! radix digits (5, 5 and 6 bits); the low 16 bits are dropped. Each digit
//! selects a cell in a layer:
//!
//! - layer 0 rows (one per histogram handle) point at layer 1 rows,
//! - layer 1 rows point at 64-counter leaves,
//! - leaves start with 32-bit counters and are promoted to 64-bit counters
//!   once a counter crosses the grow threshold.
//!
//! Every layer lives in an arena shared by all histograms of a
//! [`HistogramStore`]. A cell is a 29-bit arena index under a 3-bit tag:
//! `100` small, `110` upgrading, `111` large; zero means unallocated.
//!
//! Observation is lock-free: pointers are installed with compare-and-swap,
//! counters with atomic adds. Promotion of a hot leaf snapshots the small
//! counters into the large leaf and records the pair; [`HistogramStore::finalize`]
//! later folds in whatever observers added to the small leaf meanwhile.

mod codec;
mod summary;

pub use codec::append_observation;
pub use summary::Summary;

use crate::arena::{BatchedArena, Handle};
use crate::bitmap::Bitmap32;
use crate::config;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

const L0_SHIFT: u32 = 32 - config::HIST_L0_BITS;
const L1_SHIFT: u32 = L0_SHIFT - config::HIST_L1_BITS;
const L2_SHIFT: u32 = L1_SHIFT - config::HIST_L2_BITS;

const ROW_WIDTH: usize = 1 << config::HIST_L0_BITS;
const LEAF_WIDTH: usize = 1 << config::HIST_L2_BITS;

const INDEX_MASK: u32 = (1 << 29) - 1;
const TAG_MASK: u32 = 0b111 << 29;
const TAG_SMALL: u32 = 0b100 << 29;
const TAG_UPGRADING: u32 = 0b110 << 29;
const TAG_LARGE: u32 = 0b111 << 29;

/// Map float bits onto `u32` so that integer order equals float order
#[inline]
pub fn to_ordered(v: f32) -> u32 {
    let bits = v.to_bits();
    bits ^ ((((bits as i32) >> 31) as u32) | 0x8000_0000)
}

/// Inverse of [`to_ordered`]
#[inline]
pub fn from_ordered(t: u32) -> f32 {
    let bits = if t & 0x8000_0000 != 0 {
        t ^ 0x8000_0000
    } else {
        !t
    };
    f32::from_bits(bits)
}

/// Radix digits of one histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bucket {
    pub l0: u32,
    pub l1: u32,
    pub l2: u32,
}

impl Bucket {
    pub fn of(v: f32) -> Self {
        let t = to_ordered(v);
        Self {
            l0: t >> L0_SHIFT,
            l1: (t >> L1_SHIFT) & (ROW_WIDTH as u32 - 1),
            l2: (t >> L2_SHIFT) & (LEAF_WIDTH as u32 - 1),
        }
    }

    /// Ordered bits with the truncated tail cleared
    pub fn prefix(&self) -> u32 {
        (self.l0 << L0_SHIFT) | (self.l1 << L1_SHIFT) | (self.l2 << L2_SHIFT)
    }

    /// Value standing in for every observation of this bucket: the
    /// half-way point of the truncated tail
    pub fn representative(&self) -> f32 {
        from_ordered(self.prefix() | (1 << (L2_SHIFT - 1)))
    }
}

/// 32 tagged pointers plus a mask of the installed ones
pub struct Row {
    mask: AtomicU32,
    cells: [AtomicU32; ROW_WIDTH],
}

impl Default for Row {
    fn default() -> Self {
        Self {
            mask: AtomicU32::new(0),
            cells: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

pub struct SmallLeaf {
    counts: [AtomicU32; LEAF_WIDTH],
}

impl Default for SmallLeaf {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

pub struct LargeLeaf {
    counts: [AtomicU64; LEAF_WIDTH],
}

impl Default for LargeLeaf {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// A promotion whose small-leaf stragglers still need folding in
struct PendingUpgrade {
    small: Handle,
    snapshot: Box<[u32; LEAF_WIDTH]>,
    large: Handle,
}

/// Arena quartet shared by many histograms
pub struct HistogramStore {
    l0: BatchedArena<Row>,
    l1: BatchedArena<Row>,
    small: BatchedArena<SmallLeaf>,
    large: BatchedArena<LargeLeaf>,
    pending: Mutex<Vec<PendingUpgrade>>,
    grow_threshold: u32,
}

impl Default for HistogramStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistogramStore {
    pub fn new() -> Self {
        Self::with_grow_threshold(config::HIST_GROW_THRESHOLD)
    }

    /// Store whose leaves are promoted once a counter exceeds `threshold`
    pub fn with_grow_threshold(threshold: u32) -> Self {
        Self {
            l0: BatchedArena::new(),
            l1: BatchedArena::new(),
            small: BatchedArena::new(),
            large: BatchedArena::new(),
            pending: Mutex::new(Vec::new()),
            grow_threshold: threshold,
        }
    }

    pub fn grow_threshold(&self) -> u32 {
        self.grow_threshold
    }

    /// Allocate an empty histogram
    pub fn new_histogram(&self) -> Handle {
        checked(self.l0.alloc())
    }

    /// Number of histograms allocated
    pub fn len(&self) -> usize {
        self.l0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.l0.is_empty()
    }

    /// Record one observation. NaN and infinities are dropped.
    pub fn observe(&self, h: Handle, v: f32) {
        if !v.is_finite() {
            return;
        }
        let b = Bucket::of(v);
        let row0 = self.l0.get(h);
        let p1 = install(&row0.cells[b.l0 as usize], &row0.mask, b.l0, || {
            checked(self.l1.alloc())
        });
        let row1 = self.l1.get(p1 & INDEX_MASK);
        let cell = &row1.cells[b.l1 as usize];
        let p2 = install(cell, &row1.mask, b.l1, || checked(self.small.alloc()));

        match p2 & TAG_MASK {
            TAG_LARGE => {
                self.large.get(p2 & INDEX_MASK).counts[b.l2 as usize]
                    .fetch_add(1, Ordering::Relaxed);
            }
            tag => {
                let n = self.small.get(p2 & INDEX_MASK).counts[b.l2 as usize]
                    .fetch_add(1, Ordering::Relaxed)
                    .wrapping_add(1);
                if tag == TAG_SMALL && n > self.grow_threshold {
                    self.upgrade(cell, p2);
                }
            }
        }
    }

    /// Promote a small leaf. Only the thread winning the `small → upgrading`
    /// exchange proceeds.
    fn upgrade(&self, cell: &AtomicU32, p: u32) {
        let small_h = p & INDEX_MASK;
        if cell
            .compare_exchange(p, small_h | TAG_UPGRADING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let large_h = checked(self.large.alloc());
        let small = self.small.get(small_h);
        let large = self.large.get(large_h);
        let mut snapshot = Box::new([0u32; LEAF_WIDTH]);
        for (i, slot) in snapshot.iter_mut().enumerate() {
            let c = small.counts[i].load(Ordering::Acquire);
            *slot = c;
            large.counts[i].store(c as u64, Ordering::Relaxed);
        }
        self.pending.lock().push(PendingUpgrade {
            small: small_h,
            snapshot,
            large: large_h,
        });
        cell.store(large_h | TAG_LARGE, Ordering::Release);
        debug!(small = small_h, large = large_h, "promoted histogram leaf");
    }

    /// Fold observations that landed on small leaves during promotion into
    /// their large leaves. Must not race with [`observe`](Self::observe).
    pub fn finalize(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for up in pending {
            let small = self.small.get(up.small);
            let large = self.large.get(up.large);
            for (i, before) in up.snapshot.iter().enumerate() {
                let delta = small.counts[i].load(Ordering::Acquire).wrapping_sub(*before);
                if delta != 0 {
                    large.counts[i].fetch_add(delta as u64, Ordering::Relaxed);
                }
            }
        }
    }

    /// Promotions not yet finalized
    pub fn pending_upgrades(&self) -> usize {
        self.pending.lock().len()
    }

    /// Counters of the leaf behind a layer-1 cell
    fn leaf_counts(&self, p: u32) -> [u64; LEAF_WIDTH] {
        let idx = p & INDEX_MASK;
        if p & TAG_MASK == TAG_LARGE {
            let leaf = self.large.get(idx);
            std::array::from_fn(|i| leaf.counts[i].load(Ordering::Acquire))
        } else {
            let leaf = self.small.get(idx);
            std::array::from_fn(|i| leaf.counts[i].load(Ordering::Acquire) as u64)
        }
    }

    /// Visit every allocated leaf of `h` in bucket order
    fn visit_leaves<F>(&self, h: Handle, ascending: bool, mut f: F)
    where
        F: FnMut(u32, u32, &[u64; LEAF_WIDTH]) -> std::ops::ControlFlow<()>,
    {
        let row0 = self.l0.get(h);
        for i0 in ordered(Bitmap32::load(&row0.mask), ascending) {
            let p1 = row0.cells[i0 as usize].load(Ordering::Acquire);
            if p1 == 0 {
                continue;
            }
            let row1 = self.l1.get(p1 & INDEX_MASK);
            for i1 in ordered(Bitmap32::load(&row1.mask), ascending) {
                let p2 = row1.cells[i1 as usize].load(Ordering::Acquire);
                if p2 == 0 {
                    continue;
                }
                let counts = self.leaf_counts(p2);
                if f(i0, i1, &counts).is_break() {
                    return;
                }
            }
        }
    }

    /// Visit non-empty buckets of `h` in order
    pub fn for_each_bucket<F>(&self, h: Handle, ascending: bool, mut f: F)
    where
        F: FnMut(Bucket, u64) -> std::ops::ControlFlow<()>,
    {
        use std::ops::ControlFlow;

        self.visit_leaves(h, ascending, |l0, l1, counts| {
            let slots: Box<dyn Iterator<Item = usize>> = if ascending {
                Box::new(0..LEAF_WIDTH)
            } else {
                Box::new((0..LEAF_WIDTH).rev())
            };
            for l2 in slots {
                if counts[l2] == 0 {
                    continue;
                }
                let bucket = Bucket {
                    l0,
                    l1,
                    l2: l2 as u32,
                };
                f(bucket, counts[l2])?;
            }
            ControlFlow::Continue(())
        });
    }

    /// Non-empty buckets as `(representative, count)` in ascending order
    pub fn buckets(&self, h: Handle) -> Vec<(f32, u64)> {
        let mut out = Vec::new();
        self.for_each_bucket(h, true, |b, c| {
            out.push((b.representative(), c));
            std::ops::ControlFlow::Continue(())
        });
        out
    }
}

/// Install a fresh arena element behind `cell` unless one is there already.
/// Race losers adopt the winner's pointer; their element is leaked.
fn install(cell: &AtomicU32, mask: &AtomicU32, idx: u32, alloc: impl FnOnce() -> Handle) -> u32 {
    let p = cell.load(Ordering::Acquire);
    if p != 0 {
        return p;
    }
    let fresh = alloc() | TAG_SMALL;
    match cell.compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            Bitmap32::atomic_set(mask, idx);
            fresh
        }
        Err(winner) => winner,
    }
}

fn checked(h: Handle) -> Handle {
    assert!(h <= INDEX_MASK, "histogram arena exhausted");
    h
}

fn ordered(mask: Bitmap32, ascending: bool) -> Vec<u32> {
    if ascending {
        mask.iter().collect()
    } else {
        mask.iter_rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ordered_transform_is_monotonic() {
        let values = [
            -f32::MAX,
            -1e10,
            -1.5,
            -1.0,
            -f32::MIN_POSITIVE,
            -0.0,
            0.0,
            f32::MIN_POSITIVE,
            0.5,
            1.0,
            3.25,
            1e30,
            f32::MAX,
        ];
        for pair in values.windows(2) {
            assert!(
                to_ordered(pair[0]) < to_ordered(pair[1]),
                "{} !< {}",
                pair[0],
                pair[1]
            );
        }
        for v in values {
            assert_eq!(from_ordered(to_ordered(v)).to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_representative_stays_in_bucket() {
        for v in [-123.456f32, -1.0, 0.0, 1.0, 2.5, 1e-20, 6.02e23] {
            let b = Bucket::of(v);
            assert_eq!(Bucket::of(b.representative()), b, "{v}");
            let rel = ((b.representative() - v) / v.abs().max(f32::MIN_POSITIVE)).abs();
            assert!(v == 0.0 || rel < 0.01, "{v} -> {}", b.representative());
        }
    }

    #[test]
    fn test_non_finite_is_dropped() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        store.observe(h, f32::NAN);
        store.observe(h, f32::INFINITY);
        store.observe(h, f32::NEG_INFINITY);
        store.observe(h, 1.0);
        assert_eq!(store.total(h), 1);
    }

    #[test]
    fn test_histograms_share_arenas() {
        let store = HistogramStore::new();
        let a = store.new_histogram();
        let b = store.new_histogram();
        for i in 0..100 {
            store.observe(a, i as f32);
        }
        store.observe(b, -5.0);
        assert_eq!(store.total(a), 100);
        assert_eq!(store.total(b), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_upgrade_single_thread() {
        let store = HistogramStore::with_grow_threshold(100);
        let h = store.new_histogram();
        for _ in 0..250 {
            store.observe(h, 7.0);
        }
        assert_eq!(store.pending_upgrades(), 1);
        store.finalize();
        assert_eq!(store.pending_upgrades(), 0);
        assert_eq!(store.total(h), 250);
        assert_eq!(store.buckets(h).len(), 1);
    }

    fn contended(threads: usize, per_thread: u64, threshold: u32) {
        let store = Arc::new(HistogramStore::with_grow_threshold(threshold));
        let h = store.new_histogram();
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        store.observe(h, 42.0);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        store.finalize();
        assert_eq!(store.total(h), threads as u64 * per_thread);
    }

    #[test]
    fn test_upgrade_under_contention() {
        contended(16, 100_000, 1 << 12);
    }

    #[test]
    #[ignore = "production-scale contention: 16 threads x 2^30 observations"]
    fn test_upgrade_under_contention_full_scale() {
        contended(16, (1 << 30) + 1, config::HIST_GROW_THRESHOLD);
    }
}
