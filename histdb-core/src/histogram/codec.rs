//! Depth-first histogram serialization and exclusive merging.
//!
//! Layout: the 32-bit layer-0 occupancy mask, then for each set bit the
//! 32-bit mask of that layer-1 row, then for each of its set bits a 64-bit
//! leaf mask followed by one varint per set leaf bit. Masks are
//! little-endian.

use super::{
    install, Bucket, HistogramStore, LargeLeaf, INDEX_MASK, LEAF_WIDTH, TAG_LARGE, TAG_MASK,
};
use crate::arena::Handle;
use crate::bitmap::{Bitmap32, Bitmap64};
use crate::varint::{self, Reader};
use crate::{HistError, Result};
use bytes::BufMut;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

impl HistogramStore {
    /// Add `n` observations to one bucket. Requires exclusive access to `h`:
    /// no concurrent observers and no pending upgrades on it.
    pub(crate) fn add_count(&self, h: Handle, b: Bucket, n: u64) {
        if n == 0 {
            return;
        }
        let row0 = self.l0.get(h);
        let p1 = install(&row0.cells[b.l0 as usize], &row0.mask, b.l0, || {
            super::checked(self.l1.alloc())
        });
        let row1 = self.l1.get(p1 & INDEX_MASK);
        let cell = &row1.cells[b.l1 as usize];
        let p2 = install(cell, &row1.mask, b.l1, || super::checked(self.small.alloc()));

        if p2 & TAG_MASK == TAG_LARGE {
            self.large.get(p2 & INDEX_MASK).counts[b.l2 as usize].fetch_add(n, Ordering::Relaxed);
            return;
        }
        let slot = &self.small.get(p2 & INDEX_MASK).counts[b.l2 as usize];
        let sum = slot.load(Ordering::Relaxed) as u64 + n;
        if sum > self.grow_threshold as u64 {
            let large = self.promote_exclusive(cell, p2);
            large.counts[b.l2 as usize].fetch_add(n, Ordering::Relaxed);
        } else {
            slot.store(sum as u32, Ordering::Relaxed);
        }
    }

    /// Promotion without snapshot bookkeeping; nobody else is writing.
    fn promote_exclusive(&self, cell: &AtomicU32, p: u32) -> &LargeLeaf {
        let large_h = super::checked(self.large.alloc());
        let small = self.small.get(p & INDEX_MASK);
        let large = self.large.get(large_h);
        for i in 0..LEAF_WIDTH {
            let count = small.counts[i].load(Ordering::Relaxed) as u64;
            large.counts[i].store(count, Ordering::Relaxed);
        }
        cell.store(large_h | TAG_LARGE, Ordering::Release);
        large
    }

    /// Add every bucket of `src` (held in `src_store`) into `dst`
    pub fn merge(&self, dst: Handle, src_store: &HistogramStore, src: Handle) {
        let mut buckets = Vec::new();
        src_store.for_each_bucket(src, true, |b, c| {
            buckets.push((b, c));
            ControlFlow::Continue(())
        });
        for (b, c) in buckets {
            self.add_count(dst, b, c);
        }
    }

    /// Append the serialized form of `h`
    pub fn append_to(&self, h: Handle, out: &mut Vec<u8>) {
        let row0 = self.l0.get(h);
        let mask0 = Bitmap32::load(&row0.mask);
        out.put_u32_le(mask0.0);
        for i0 in mask0.iter() {
            let p1 = row0.cells[i0 as usize].load(Ordering::Acquire);
            let row1 = self.l1.get(p1 & INDEX_MASK);
            let mask1 = Bitmap32::load(&row1.mask);
            out.put_u32_le(mask1.0);
            for i1 in mask1.iter() {
                let p2 = row1.cells[i1 as usize].load(Ordering::Acquire);
                let counts = self.leaf_counts(p2);
                let mut mask2 = Bitmap64(0);
                for (i2, c) in counts.iter().enumerate() {
                    if *c != 0 {
                        mask2.set(i2 as u32);
                    }
                }
                out.put_u64_le(mask2.0);
                for i2 in mask2.iter() {
                    varint::append(out, counts[i2 as usize]);
                }
            }
        }
    }

    pub fn serialize(&self, h: Handle) -> Vec<u8> {
        let mut out = Vec::new();
        self.append_to(h, &mut out);
        out
    }

    /// Decode one serialized histogram from `reader` and add it into `h`
    pub fn merge_from(&self, h: Handle, reader: &mut Reader<'_>) -> Result<()> {
        let start = reader.position();
        let mask0 = Bitmap32(reader.u32_le()?);
        for l0 in mask0.iter() {
            let mask1 = Bitmap32(reader.u32_le()?);
            for l1 in mask1.iter() {
                let mask2 = Bitmap64(reader.u64_le()?);
                for l2 in mask2.iter() {
                    let n = reader.varint()?;
                    self.add_count(h, Bucket { l0, l1, l2 }, n);
                }
            }
        }
        trace!(handle = h, bytes = reader.position() - start, "merged serialized histogram");
        Ok(())
    }

    /// Decode `bytes` into `h`, requiring the whole slice to be consumed
    pub fn merge_bytes(&self, h: Handle, bytes: &[u8]) -> Result<()> {
        let mut reader = Reader::new(bytes);
        self.merge_from(h, &mut reader)?;
        if !reader.is_empty() {
            return Err(HistError::InvalidFormat(format!(
                "{} trailing bytes after histogram",
                bytes.len() - reader.position()
            )));
        }
        Ok(())
    }

    /// Decode into a freshly allocated histogram
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Handle> {
        let h = self.new_histogram();
        self.merge_bytes(h, bytes)?;
        Ok(h)
    }

    /// Serialize `h` as consecutive self-contained histograms of at most
    /// `max_len` bytes each, handing every piece to `emit`. Merging the
    /// pieces gives back `h`. Returns the number of pieces.
    pub fn append_chunks<F>(&self, h: Handle, max_len: usize, mut emit: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        if max_len < SINGLE_MAX_LEN {
            return Err(HistError::InvalidFormat(format!(
                "chunk limit {max_len} cannot hold one bucket"
            )));
        }
        let mut buckets = Vec::new();
        self.for_each_bucket(h, true, |b, c| {
            buckets.push((b, c));
            ControlFlow::Continue(())
        });
        buckets.sort_unstable();

        let mut out = Vec::new();
        let mut chunks = 0;
        let mut start = 0;
        let mut size = 4;
        let mut prev: Option<Bucket> = None;
        for (i, &(b, c)) in buckets.iter().enumerate() {
            let grow = varint::len(c)
                + match prev {
                    Some(p) if p.l0 == b.l0 && p.l1 == b.l1 => 0,
                    Some(p) if p.l0 == b.l0 => 8,
                    _ => 12,
                };
            if prev.is_some() && size + grow > max_len {
                encode_buckets(&buckets[start..i], &mut out);
                emit(&out)?;
                out.clear();
                chunks += 1;
                start = i;
                size = 4 + 12 + varint::len(c);
            } else {
                size += grow;
            }
            prev = Some(b);
        }
        if chunks == 0 || start < buckets.len() {
            encode_buckets(&buckets[start..], &mut out);
            emit(&out)?;
            chunks += 1;
        }
        Ok(chunks)
    }
}

/// Largest encoding of a histogram with a single bucket
const SINGLE_MAX_LEN: usize = 4 + 4 + 8 + varint::MAX_LEN;

/// Append the serialized form of a histogram holding one observation of
/// `v`. A non-finite value encodes as the empty histogram.
pub fn append_observation(v: f32, out: &mut Vec<u8>) {
    if v.is_finite() {
        encode_buckets(&[(Bucket::of(v), 1)], out);
    } else {
        out.put_u32_le(0);
    }
}

/// Encode buckets sorted by `(l0, l1, l2)` in the layout of
/// [`HistogramStore::append_to`]
fn encode_buckets(buckets: &[(Bucket, u64)], out: &mut Vec<u8>) {
    let mut mask0 = Bitmap32(0);
    for (b, _) in buckets {
        mask0.set(b.l0);
    }
    out.put_u32_le(mask0.0);
    for row in groups(buckets, |b| b.l0) {
        let mut mask1 = Bitmap32(0);
        for (b, _) in row {
            mask1.set(b.l1);
        }
        out.put_u32_le(mask1.0);
        for leaf in groups(row, |b| b.l1) {
            let mut mask2 = Bitmap64(0);
            for (b, _) in leaf {
                mask2.set(b.l2);
            }
            out.put_u64_le(mask2.0);
            for (_, c) in leaf {
                varint::append(out, *c);
            }
        }
    }
}

/// Split `buckets` into runs sharing the same digit
fn groups<'a, D>(
    buckets: &'a [(Bucket, u64)],
    digit: D,
) -> impl Iterator<Item = &'a [(Bucket, u64)]>
where
    D: Fn(&Bucket) -> u32 + 'a,
{
    let mut rest = buckets;
    std::iter::from_fn(move || {
        let first = rest.first()?;
        let d = digit(&first.0);
        let n = rest.iter().take_while(|(b, _)| digit(b) == d).count();
        let (run, tail) = rest.split_at(n);
        rest = tail;
        Some(run)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_histogram(store: &HistogramStore, seed: u64, n: usize) -> Handle {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let h = store.new_histogram();
        for _ in 0..n {
            let v: f32 = rng.gen_range(-1e6..1e6);
            store.observe(h, v);
        }
        h
    }

    #[test]
    fn test_empty_serializes_to_zero_mask() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        assert_eq!(store.serialize(h), vec![0, 0, 0, 0]);
        let back = store.deserialize(&[0, 0, 0, 0]).unwrap();
        assert_eq!(store.total(back), 0);
    }

    #[test]
    fn test_roundtrip_preserves_summaries() {
        let store = HistogramStore::new();
        let h = random_histogram(&store, 11, 5000);
        let bytes = store.serialize(h);

        let other = HistogramStore::new();
        let back = other.deserialize(&bytes).unwrap();
        assert_eq!(other.total(back), store.total(h));
        assert_eq!(other.min(back), store.min(h));
        assert_eq!(other.max(back), store.max(h));
        for q in [0.01, 0.5, 0.9, 0.99] {
            assert_eq!(other.quantile(back, q), store.quantile(h, q));
        }
        assert_eq!(other.serialize(back), bytes);
    }

    #[test]
    fn test_merge_across_stores() {
        let a = HistogramStore::new();
        let b = HistogramStore::new();
        let ha = random_histogram(&a, 1, 1000);
        let hb = random_histogram(&b, 2, 700);
        let before_a = a.buckets(ha);
        a.merge(ha, &b, hb);
        assert_eq!(a.total(ha), 1700);
        assert!(a.buckets(ha).len() >= before_a.len());
        assert!(a.min(ha).unwrap() <= b.min(hb).unwrap());
        assert!(a.max(ha).unwrap() >= b.max(hb).unwrap());
    }

    #[test]
    fn test_merge_promotes_past_threshold() {
        let store = HistogramStore::with_grow_threshold(10);
        let a = store.new_histogram();
        let b = store.new_histogram();
        for _ in 0..8 {
            store.observe(a, 3.0);
            store.observe(b, 3.0);
        }
        store.merge(a, &store, b);
        assert_eq!(store.total(a), 16);
        assert_eq!(store.pending_upgrades(), 0);

        let bytes = store.serialize(a);
        let back = store.deserialize(&bytes).unwrap();
        assert_eq!(store.total(back), 16);
    }

    #[test]
    fn test_single_observation_matches_store_encoding() {
        let store = HistogramStore::new();
        for v in [0.0f32, -3.5, 1e-30, 7.25e12] {
            let h = store.new_histogram();
            store.observe(h, v);
            let mut single = Vec::new();
            append_observation(v, &mut single);
            assert_eq!(single, store.serialize(h), "{v}");
        }
        let mut nan = Vec::new();
        append_observation(f32::NAN, &mut nan);
        assert_eq!(nan, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_chunks_stay_small_and_merge_back() {
        let store = HistogramStore::new();
        let h = store.new_histogram();
        for i in 0..3000 {
            let v = 2f32.powi(i % 200 - 100) * (1.0 + (i % 61) as f32 / 61.0);
            store.observe(h, v);
        }
        let whole = store.serialize(h);
        assert!(whole.len() > 2012);

        let out = HistogramStore::new();
        let merged = out.new_histogram();
        let mut sizes = Vec::new();
        let chunks = store
            .append_chunks(h, 512, |piece| {
                sizes.push(piece.len());
                out.merge_bytes(merged, piece)
            })
            .unwrap();
        assert_eq!(chunks, sizes.len());
        assert!(chunks > 1);
        assert!(sizes.iter().all(|n| *n <= 512), "{sizes:?}");
        assert_eq!(out.serialize(merged), whole);
    }

    #[test]
    fn test_small_histogram_is_one_chunk() {
        let store = HistogramStore::new();
        let h = random_histogram(&store, 4, 10);
        let mut pieces = Vec::new();
        let n = store
            .append_chunks(h, 2012, |p| {
                pieces.push(p.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(pieces[0], store.serialize(h));

        let empty = store.new_histogram();
        assert_eq!(store.append_chunks(empty, 2012, |_| Ok(())).unwrap(), 1);
        assert!(store.append_chunks(h, 8, |_| Ok(())).is_err());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let store = HistogramStore::new();
        let h = random_histogram(&store, 5, 100);
        let bytes = store.serialize(h);
        let err = store.deserialize(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, HistError::ShortBuffer { .. }));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            store.merge_bytes(store.new_histogram(), &padded),
            Err(HistError::InvalidFormat(_))
        ));
    }
}
