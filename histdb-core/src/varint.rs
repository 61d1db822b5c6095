//! Little-endian prefix varints.
//!
//! The number of trailing one bits in the first byte, plus one, is the encoded
//! length. Lengths 1..=8 carry `7 * n` value bits; anything wider is stored as
//! `0xFF` followed by the full 8-byte little-endian value.

use crate::{HistError, Result};

/// Longest possible encoding
pub const MAX_LEN: usize = 9;

/// Encoded length of `x`
#[inline]
pub fn len(x: u64) -> usize {
    let bits = 64 - x.leading_zeros() as usize;
    if bits > 56 {
        MAX_LEN
    } else {
        ((bits + 6) / 7).max(1)
    }
}

/// Append the encoding of `x` to `buf`
#[inline]
pub fn append(buf: &mut Vec<u8>, x: u64) {
    let n = len(x);
    if n == MAX_LEN {
        buf.push(0xFF);
        buf.extend_from_slice(&x.to_le_bytes());
    } else {
        let word = (x << n) | ((1u64 << (n - 1)) - 1);
        buf.extend_from_slice(&word.to_le_bytes()[..n]);
    }
}

/// Decode one varint, returning the value and the number of bytes consumed.
///
/// Takes the fast path when at least 9 bytes are readable.
#[inline]
pub fn consume(buf: &[u8]) -> Option<(u64, usize)> {
    if buf.len() >= MAX_LEN {
        Some(consume_fast(buf))
    } else {
        consume_slow(buf)
    }
}

/// Decode from a buffer with at least [`MAX_LEN`] readable bytes
#[inline]
pub fn consume_fast(buf: &[u8]) -> (u64, usize) {
    let first = buf[0];
    let n = first.trailing_ones() as usize + 1;
    let mut word = [0u8; 8];
    if n == MAX_LEN {
        word.copy_from_slice(&buf[1..MAX_LEN]);
        (u64::from_le_bytes(word), MAX_LEN)
    } else {
        word.copy_from_slice(&buf[..8]);
        let raw = u64::from_le_bytes(word);
        let mask = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        ((raw & mask) >> n, n)
    }
}

/// Decode near the end of a buffer
pub fn consume_slow(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let n = first.trailing_ones() as usize + 1;
    if buf.len() < n {
        return None;
    }
    let mut word = [0u8; 8];
    if n == MAX_LEN {
        word.copy_from_slice(&buf[1..MAX_LEN]);
        Some((u64::from_le_bytes(word), MAX_LEN))
    } else {
        word[..n].copy_from_slice(&buf[..n]);
        Some((u64::from_le_bytes(word) >> n, n))
    }
}

/// Cursor-style reader over a byte slice that turns underruns into errors
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn varint(&mut self) -> Result<u64> {
        let rest = self.remaining();
        match consume(rest) {
            Some((v, n)) => {
                self.pos += n;
                Ok(v)
            }
            None => {
                let needed = rest.first().map_or(1, |b| b.trailing_ones() as usize + 1);
                Err(HistError::short(needed, rest.len()))
            }
        }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let rest = self.remaining();
        if rest.len() < n {
            return Err(HistError::short(n, rest.len()));
        }
        self.pos += n;
        Ok(&rest[..n])
    }

    /// Varint length followed by that many bytes
    pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
        let n = self.varint()? as usize;
        self.bytes(n)
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut w = [0u8; 8];
        w.copy_from_slice(b);
        Ok(u64::from_le_bytes(w))
    }
}

/// Append a varint length followed by the bytes
pub fn append_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    append(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}
