//! Fixed-width words used as small integer sets

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

macro_rules! bitmap {
    ($(#[$doc:meta])* $name:ident, $word:ty, $atomic:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name(pub $word);

        impl $name {
            /// Width in bits
            pub const BITS: u32 = <$word>::BITS;

            #[inline]
            pub fn empty(&self) -> bool {
                self.0 == 0
            }

            /// Index of the lowest set bit; 0 for an empty map, so test
            /// [`empty`](Self::empty) first.
            #[inline]
            pub fn lowest(&self) -> u32 {
                if self.0 == 0 {
                    0
                } else {
                    self.0.trailing_zeros()
                }
            }

            /// Index of the highest set bit; 0 for an empty map
            #[inline]
            pub fn highest(&self) -> u32 {
                if self.0 == 0 {
                    0
                } else {
                    Self::BITS - 1 - self.0.leading_zeros()
                }
            }

            #[inline]
            pub fn clear_lowest(&mut self) {
                self.0 &= self.0.wrapping_sub(1);
            }

            #[inline]
            pub fn clear_highest(&mut self) {
                if self.0 != 0 {
                    self.0 &= !(1 << self.highest());
                }
            }

            #[inline]
            pub fn set(&mut self, idx: u32) {
                self.0 |= 1 << (idx % Self::BITS);
            }

            #[inline]
            pub fn contains(&self, idx: u32) -> bool {
                self.0 & (1 << (idx % Self::BITS)) != 0
            }

            #[inline]
            pub fn count(&self) -> u32 {
                self.0.count_ones()
            }

            /// Bits below `idx`
            #[inline]
            pub fn below(&self, idx: u32) -> Self {
                if idx >= Self::BITS {
                    *self
                } else {
                    Self(self.0 & ((1 << idx) - 1))
                }
            }

            /// Set bits in ascending order
            pub fn iter(self) -> impl Iterator<Item = u32> {
                let mut rest = self;
                std::iter::from_fn(move || {
                    if rest.empty() {
                        None
                    } else {
                        let i = rest.lowest();
                        rest.clear_lowest();
                        Some(i)
                    }
                })
            }

            /// Set bits in descending order
            pub fn iter_rev(self) -> impl Iterator<Item = u32> {
                let mut rest = self;
                std::iter::from_fn(move || {
                    if rest.empty() {
                        None
                    } else {
                        let i = rest.highest();
                        rest.clear_highest();
                        Some(i)
                    }
                })
            }

            /// Set `idx` in a shared word with an atomic add.
            ///
            /// Callers set each bit at most once; a second set carries into
            /// the next bit.
            #[inline]
            pub fn atomic_set(cell: &$atomic, idx: u32) {
                cell.fetch_add(1 << (idx % Self::BITS), Ordering::AcqRel);
            }

            #[inline]
            pub fn load(cell: &$atomic) -> Self {
                Self(cell.load(Ordering::Acquire))
            }
        }
    };
}

bitmap!(
    /// 32-bit integer set
    Bitmap32, u32, AtomicU32
);

bitmap!(
    /// 64-bit integer set
    Bitmap64, u64, AtomicU64
);
