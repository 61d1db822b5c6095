//! Core types for HistDB

use std::cmp::Ordering;
use std::fmt;
use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

/// Observation timestamp (seconds, caller-defined epoch)
pub type Timestamp = u32;

/// Observation duration in the same unit as [`Timestamp`]
pub type Duration = u32;

/// Size of a [`MetricHash`] in bytes
pub const HASH_SIZE: usize = 24;

/// Size of a [`Key`] in bytes
pub const KEY_SIZE: usize = 32;

/// Fixed-width hash usable as a key of [`crate::hashtable::HashTable`].
pub trait HashKey: Copy + Eq + Default + fmt::Debug {
    /// Encoded width in bytes
    const SIZE: usize;

    /// 64 bits of entropy used to pick a bucket
    fn bucket_hash(&self) -> u64;

    /// Raw little-endian bytes
    fn as_bytes(&self) -> &[u8];

    /// Rebuild from exactly `SIZE` bytes
    fn from_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! hash_type {
    ($(#[$doc:meta])* $name:ident, $size:expr, |$s:ident| $bucket:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $size]);

        impl HashKey for $name {
            const SIZE: usize = $size;

            #[inline]
            fn bucket_hash(&self) -> u64 {
                let $s = self;
                $bucket
            }

            #[inline]
            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $size] = bytes.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                for b in self.0.iter().rev() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }
    };
}

hash_type!(
    /// 64-bit xxh3 hash of a tag key
    TagKeyHash, 8, |s| u64::from_le_bytes(s.0)
);

hash_type!(
    /// 128-bit xxh3 hash of a full `key=value` tag
    TagHash, 16, |s| {
        let v = u128::from_le_bytes(s.0);
        (v as u64) ^ ((v >> 64) as u64)
    }
);

hash_type!(
    /// Commutative fingerprint of a metric: sum of its distinct tag-key
    /// hashes followed by the sum of its distinct tag hashes.
    MetricHash, 24, |s| {
        let a = u64::from_le_bytes(s.0[0..8].try_into().unwrap_or_default());
        let b = u64::from_le_bytes(s.0[8..16].try_into().unwrap_or_default());
        let c = u64::from_le_bytes(s.0[16..24].try_into().unwrap_or_default());
        a ^ b.rotate_left(21) ^ c.rotate_left(42)
    }
);

impl TagKeyHash {
    /// Hash the raw (still escaped) tag key bytes
    pub fn of(key: &[u8]) -> Self {
        Self(xxh3_64(key).to_le_bytes())
    }

    pub fn value(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl TagHash {
    /// Hash the raw (still escaped) `key=value` bytes
    pub fn of(tag: &[u8]) -> Self {
        Self(xxh3_128(tag).to_le_bytes())
    }

    pub fn value(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }
}

impl MetricHash {
    /// Add a tag-key hash into the first component
    pub fn add_tag_key(&mut self, h: TagKeyHash) {
        let mut lo = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        let sum = u64::from_le_bytes(lo).wrapping_add(h.value());
        self.0[..8].copy_from_slice(&sum.to_le_bytes());
    }

    /// Add a tag hash into the second component
    pub fn add_tag(&mut self, h: TagHash) {
        let mut hi = [0u8; 16];
        hi.copy_from_slice(&self.0[8..]);
        let sum = u128::from_le_bytes(hi).wrapping_add(h.value());
        self.0[8..].copy_from_slice(&sum.to_le_bytes());
    }
}

/// 32-byte storage key: `MetricHash ‖ timestamp (LE) ‖ duration (LE)`.
///
/// Keys order by plain byte comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Default for Key {
    fn default() -> Self {
        Key([0u8; KEY_SIZE])
    }
}

impl Key {
    /// Create a key from its parts
    pub fn new(hash: &MetricHash, timestamp: Timestamp, duration: Duration) -> Self {
        let mut k = [0u8; KEY_SIZE];
        k[..HASH_SIZE].copy_from_slice(&hash.0);
        k[24..28].copy_from_slice(&timestamp.to_le_bytes());
        k[28..32].copy_from_slice(&duration.to_le_bytes());
        Key(k)
    }

    /// Rebuild from a 32-byte slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Key(bytes.try_into().ok()?))
    }

    pub fn hash(&self) -> MetricHash {
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&self.0[..HASH_SIZE]);
        MetricHash(h)
    }

    pub fn hash_bytes(&self) -> &[u8] {
        &self.0[..HASH_SIZE]
    }

    pub fn timestamp(&self) -> Timestamp {
        u32::from_le_bytes([self.0[24], self.0[25], self.0[26], self.0[27]])
    }

    pub fn duration(&self) -> Duration {
        u32::from_le_bytes([self.0[28], self.0[29], self.0[30], self.0[31]])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Leading 8 bytes as a big-endian integer, the first comparison stage
    /// of page searches.
    #[inline]
    pub fn prefix(&self) -> u64 {
        let mut p = [0u8; 8];
        p.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(p)
    }

    /// Two-stage comparison: big-endian prefix, then the full key
    #[inline]
    pub fn compare(&self, other: &Key) -> Ordering {
        match self.prefix().cmp(&other.prefix()) {
            Ordering::Equal => self.0.cmp(&other.0),
            ord => ord,
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("hash", &self.hash())
            .field("timestamp", &self.timestamp())
            .field("duration", &self.duration())
            .finish()
    }
}

/// Half-open range of level-0 generations `[low, high)` covered by a level-N
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenRange {
    pub low: u32,
    pub high: u32,
}

impl GenRange {
    /// Create a range; `low < high` must hold
    pub fn new(low: u32, high: u32) -> Self {
        debug_assert!(low < high, "empty generation range");
        Self { low, high }
    }

    /// Range covering a single generation
    pub fn single(generation: u32) -> Self {
        Self::new(generation, generation + 1)
    }

    pub fn width(&self) -> u32 {
        self.high - self.low
    }

    /// `ceil(log2(high - low))`
    pub fn depth(&self) -> u32 {
        let w = self.width();
        if w <= 1 {
            0
        } else {
            32 - (w - 1).leading_zeros()
        }
    }

    /// True when `self` ends exactly where `next` starts
    pub fn adjoins(&self, next: &GenRange) -> bool {
        self.high == next.low
    }

    pub fn contains(&self, generation: u32) -> bool {
        generation >= self.low && generation < self.high
    }
}

impl fmt::Display for GenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let mut h = MetricHash::default();
        h.add_tag_key(TagKeyHash::of(b"host"));
        h.add_tag(TagHash::of(b"host=a"));
        let key = Key::new(&h, 0x01020304, 7);

        assert_eq!(key.hash(), h);
        assert_eq!(key.timestamp(), 0x01020304);
        assert_eq!(key.duration(), 7);
        assert_eq!(&key.0[24..28], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_key_ordering_matches_bytes() {
        let a = Key([1u8; 32]);
        let mut b = a;
        b.0[31] = 2;
        let mut c = a;
        c.0[0] = 0;
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(c.compare(&a), Ordering::Less);
        assert_eq!(a.compare(&a), Ordering::Equal);
        assert_eq!(a.cmp(&b), a.compare(&b));
    }

    #[test]
    fn test_metric_hash_is_commutative() {
        let tags: [&[u8]; 3] = [b"a=1", b"b=2", b"c=3"];
        let mut forward = MetricHash::default();
        for t in tags {
            forward.add_tag(TagHash::of(t));
        }
        let mut backward = MetricHash::default();
        for t in tags.iter().rev() {
            backward.add_tag(TagHash::of(t));
        }
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_metric_hash_carries() {
        let mut h = MetricHash::default();
        h.add_tag_key(TagKeyHash(u64::MAX.to_le_bytes()));
        h.add_tag_key(TagKeyHash(2u64.to_le_bytes()));
        assert_eq!(&h.0[..8], &1u64.to_le_bytes());
        // tag-key overflow must not leak into the tag component
        assert!(h.0[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_gen_range_depth() {
        assert_eq!(GenRange::new(0, 1).depth(), 0);
        assert_eq!(GenRange::new(0, 2).depth(), 1);
        assert_eq!(GenRange::new(4, 7).depth(), 2);
        assert_eq!(GenRange::new(0, 8).depth(), 3);
        assert_eq!(GenRange::new(0, 9).depth(), 4);
        assert!(GenRange::new(0, 2).adjoins(&GenRange::new(2, 4)));
        assert!(GenRange::new(2, 4).contains(3));
    }

    #[test]
    fn test_hash_key_roundtrip() {
        let h = TagHash::of(b"x=y");
        assert_eq!(TagHash::from_slice(h.as_bytes()), Some(h));
        assert_eq!(TagHash::from_slice(&[0u8; 3]), None);
    }
}
