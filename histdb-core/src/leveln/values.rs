//! Span-aligned value file.
//!
//! A span holds the entries of one metric hash:
//!
//! ```text
//! hash [24] | (end u16, timestamp u32, duration u32, payload)* | 0u16 | pad
//! ```
//!
//! `end` is the offset just past the entry, relative to the span start. The
//! span is zero padded to a 256-byte boundary and never exceeds 2 KiB.

use super::SpanOffset;
use crate::config::{VALUE_ENTRY_HEADER_SIZE, VALUE_SPAN_ALIGN, VALUE_SPAN_SIZE};
use crate::error::io_context;
use crate::merge::KeyIterator;
use crate::types::{Duration, Key, MetricHash, Timestamp, HASH_SIZE};
use crate::{HistError, Result};
use bytes::{Buf, BufMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Largest payload a single entry can carry
pub const MAX_VALUE_LEN: usize = VALUE_SPAN_SIZE - HASH_SIZE - VALUE_ENTRY_HEADER_SIZE - 2;

fn round_up(n: usize) -> usize {
    (n + VALUE_SPAN_ALIGN - 1) / VALUE_SPAN_ALIGN * VALUE_SPAN_ALIGN
}

pub struct ValueWriter {
    path: PathBuf,
    out: BufWriter<File>,
    span: Vec<u8>,
    open: bool,
    /// Offset of the next span, in alignment units
    next: u64,
}

impl ValueWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| io_context(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::with_capacity(16 * VALUE_SPAN_SIZE, file),
            span: Vec::with_capacity(VALUE_SPAN_SIZE),
            open: false,
            next: 0,
        })
    }

    pub fn has_open_span(&self) -> bool {
        self.open
    }

    /// Start a span for `hash`
    pub fn begin_span(&mut self, hash: &MetricHash) -> Result<()> {
        if self.open {
            return Err(HistError::InvalidSpan("span already open".into()));
        }
        self.span.clear();
        self.span.put_slice(&hash.0);
        self.open = true;
        Ok(())
    }

    /// True if an entry with a `len`-byte payload fits in the open span,
    /// leaving room for the terminator
    pub fn can_append(&self, len: usize) -> bool {
        self.open && self.span.len() + VALUE_ENTRY_HEADER_SIZE + len + 2 <= VALUE_SPAN_SIZE
    }

    pub fn append(&mut self, timestamp: Timestamp, duration: Duration, value: &[u8]) -> Result<()> {
        if value.len() > MAX_VALUE_LEN {
            return Err(HistError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        if !self.can_append(value.len()) {
            return Err(HistError::InvalidSpan(format!(
                "{} byte entry does not fit the open span",
                value.len()
            )));
        }
        let end = self.span.len() + VALUE_ENTRY_HEADER_SIZE + value.len();
        self.span.put_u16_le(end as u16);
        self.span.put_u32_le(timestamp);
        self.span.put_u32_le(duration);
        self.span.put_slice(value);
        Ok(())
    }

    /// Terminate, pad and write the open span. Returns its offset and its
    /// length, both in alignment units.
    pub fn finish_span(&mut self) -> Result<(SpanOffset, u8)> {
        if !self.open {
            return Err(HistError::InvalidSpan("no open span".into()));
        }
        self.span.put_u16_le(0);
        let len = round_up(self.span.len());
        self.span.resize(len, 0);
        self.out
            .write_all(&self.span)
            .map_err(|e| io_context(&self.path, e))?;

        let offset = SpanOffset::try_from(self.next).map_err(|_| {
            HistError::InvalidSpan(format!("{}: value file offset overflow", self.path.display()))
        })?;
        let units = (len / VALUE_SPAN_ALIGN) as u8;
        self.next += units as u64;
        self.open = false;
        Ok((offset, units))
    }

    /// Flush and sync. Returns the file length in bytes.
    pub fn finish(mut self) -> Result<u64> {
        if self.open {
            self.finish_span()?;
        }
        self.out.flush().map_err(|e| io_context(&self.path, e))?;
        let file = self
            .out
            .into_inner()
            .map_err(|e| io_context(&self.path, e.into_error()))?;
        file.sync_all().map_err(|e| io_context(&self.path, e))?;
        Ok(self.next * VALUE_SPAN_ALIGN as u64)
    }
}

/// Cursor over the entries of a value file, one span at a time
pub struct ValueIter<'a> {
    file: &'a File,
    path: &'a Path,
    len: u64,
    /// Byte offset of the loaded span
    span_at: u64,
    buf: Vec<u8>,
    loaded: bool,
    pos: usize,
    key: Key,
    value: (usize, usize),
    /// The current entry has not been handed out yet
    primed: bool,
}

impl<'a> ValueIter<'a> {
    /// Iterate from the span at `offset` (alignment units) to the end of
    /// the file
    pub fn new(file: &'a File, path: &'a Path, offset: SpanOffset) -> Result<Self> {
        let len = file.metadata().map_err(|e| io_context(path, e))?.len();
        Ok(Self {
            file,
            path,
            len,
            span_at: offset as u64 * VALUE_SPAN_ALIGN as u64,
            buf: Vec::with_capacity(VALUE_SPAN_SIZE),
            loaded: false,
            pos: 0,
            key: Key::default(),
            value: (0, 0),
            primed: false,
        })
    }

    fn load(&mut self) -> Result<bool> {
        if self.span_at >= self.len {
            return Ok(false);
        }
        let n = (self.len - self.span_at).min(VALUE_SPAN_SIZE as u64) as usize;
        if n < HASH_SIZE + 2 {
            return Err(HistError::InvalidSpan(format!(
                "{}: {n} trailing bytes at {}",
                self.path.display(),
                self.span_at
            )));
        }
        self.buf.resize(n, 0);
        self.file
            .read_exact_at(&mut self.buf, self.span_at)
            .map_err(|e| io_context(self.path, e))?;
        self.key.0[..HASH_SIZE].copy_from_slice(&self.buf[..HASH_SIZE]);
        self.pos = HASH_SIZE;
        self.loaded = true;
        Ok(true)
    }

    fn corrupt(&self, what: &str) -> HistError {
        HistError::InvalidSpan(format!(
            "{}: {what} in span at {} (entry {})",
            self.path.display(),
            self.span_at,
            self.pos
        ))
    }

    /// Advance until the current key is `>= target`; the next call to
    /// [`KeyIterator::next`] yields it
    pub fn seek(&mut self, target: &Key) -> Result<bool> {
        while self.advance()? {
            if self.key >= *target {
                self.primed = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.loaded && !self.load()? {
                return Ok(false);
            }
            if self.pos + 2 > self.buf.len() {
                return Err(self.corrupt("missing terminator"));
            }
            let mut header = &self.buf[self.pos..];
            let end = header.get_u16_le() as usize;
            if end == 0 {
                self.span_at += round_up(self.pos + 2) as u64;
                self.loaded = false;
                continue;
            }
            if end < self.pos + VALUE_ENTRY_HEADER_SIZE || end + 2 > self.buf.len() {
                return Err(self.corrupt(&format!("entry end {end} out of range")));
            }
            let timestamp = header.get_u32_le();
            let duration = header.get_u32_le();
            self.key.0[24..28].copy_from_slice(&timestamp.to_le_bytes());
            self.key.0[28..32].copy_from_slice(&duration.to_le_bytes());
            self.value = (self.pos + VALUE_ENTRY_HEADER_SIZE, end);
            self.pos = end;
            return Ok(true);
        }
    }
}

impl KeyIterator for ValueIter<'_> {
    fn next(&mut self) -> Result<bool> {
        if self.primed {
            self.primed = false;
            return Ok(true);
        }
        self.advance()
    }

    fn key(&self) -> &Key {
        &self.key
    }

    fn value(&self) -> &[u8] {
        &self.buf[self.value.0..self.value.1]
    }
}
