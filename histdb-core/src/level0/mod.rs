//! Level-0: a fixed-size append-only write buffer in one file.
//!
//! File layout:
//!
//! ```text
//! [0, 32)                 file header
//! [32, cursor)            entries, each padded to 32 bytes
//! [DATA_SIZE, +INDEX)     sorted index, one u16 slot (position / 32) per entry
//! ```
//!
//! Entry: `len u32 | key [32] | timestamp u32 | duration u32 | name_len u32 |
//! value_len u32 | name | value | pad`. A zero length ends the entry run.
//! A key may repeat; each entry is a delta and readers fold them. The index
//! orders entries by key, then by position, and is only present once the
//! buffer is finished. An unfinished file is recovered by scanning entries
//! from the header.

mod reader;
mod writer;

pub use reader::{Entry, Level0Iter, Level0Reader};
pub use writer::{Appended, Level0Writer};

use crate::config::{L0_DATA_SIZE, L0_ENTRY_ALIGN, L0_INDEX_SIZE};
use crate::error::io_context;
use crate::types::Key;
use crate::{HistError, Result};
use bytes::{Buf, BufMut};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Full preallocated size of a level-0 file
pub const FILE_SIZE: u64 = (L0_DATA_SIZE + L0_INDEX_SIZE) as u64;

pub const FILE_HEADER_SIZE: usize = 32;
pub const ENTRY_HEADER_SIZE: usize = 4 + 32 + 4 + 4 + 4 + 4;

const MAGIC: &[u8; 8] = b"histdbL0";
const VERSION: u32 = 1;
const FLAG_FINISHED: u32 = 1;

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FileHeader {
    pub finished: bool,
    pub slots: u32,
    pub cursor: u32,
}

impl FileHeader {
    pub(crate) fn encode(&self, out: &mut impl BufMut) {
        out.put_slice(MAGIC);
        out.put_u32_le(VERSION);
        out.put_u32_le(if self.finished { FLAG_FINISHED } else { 0 });
        out.put_u32_le(self.slots);
        out.put_u32_le(self.cursor);
        out.put_bytes(0, FILE_HEADER_SIZE - 24);
    }

    pub(crate) fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(HistError::short(FILE_HEADER_SIZE, buf.len()));
        }
        if &buf[..8] != MAGIC {
            return Err(HistError::InvalidFormat("not a level-0 file".into()));
        }
        buf.advance(8);
        let version = buf.get_u32_le();
        if version != VERSION {
            return Err(HistError::InvalidFormat(format!(
                "unsupported level-0 version {version}"
            )));
        }
        let flags = buf.get_u32_le();
        Ok(Self {
            finished: flags & FLAG_FINISHED != 0,
            slots: buf.get_u32_le(),
            cursor: buf.get_u32_le(),
        })
    }
}

/// True if the file at `path` was preallocated but never written
pub fn is_blank(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| io_context(path, e))?;
    let len = file.metadata().map_err(|e| io_context(path, e))?.len();
    let mut head = vec![0u8; (len as usize).min(FILE_HEADER_SIZE)];
    file.read_exact_at(&mut head, 0)
        .map_err(|e| io_context(path, e))?;
    Ok(head.iter().all(|b| *b == 0))
}

/// Padded on-disk size of an entry
pub fn entry_len(name: usize, value: usize) -> usize {
    let raw = ENTRY_HEADER_SIZE + name + value;
    (raw + L0_ENTRY_ALIGN - 1) / L0_ENTRY_ALIGN * L0_ENTRY_ALIGN
}

pub(crate) fn encode_entry(out: &mut impl BufMut, key: &Key, name: &[u8], value: &[u8]) {
    let len = entry_len(name.len(), value.len());
    out.put_u32_le(len as u32);
    out.put_slice(key.as_bytes());
    out.put_u32_le(key.timestamp());
    out.put_u32_le(key.duration());
    out.put_u32_le(name.len() as u32);
    out.put_u32_le(value.len() as u32);
    out.put_slice(name);
    out.put_slice(value);
    out.put_bytes(0, len - ENTRY_HEADER_SIZE - name.len() - value.len());
}

/// Header fields of one entry
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub len: usize,
    pub key: Key,
    pub name_len: usize,
    pub value_len: usize,
}

/// Parse the entry at `pos`. `None` marks the end of the entry run.
pub(crate) fn decode_entry(data: &[u8], pos: usize) -> Result<Option<EntryHeader>> {
    let Some(mut buf) = data.get(pos..) else {
        return Ok(None);
    };
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = buf.get_u32_le() as usize;
    if len == 0 {
        return Ok(None);
    }
    if len % L0_ENTRY_ALIGN != 0 || len < ENTRY_HEADER_SIZE || pos + len > data.len() {
        return Err(HistError::Corruption(format!(
            "level-0 entry at {pos} has bad length {len}"
        )));
    }
    let mut key = [0u8; 32];
    buf.copy_to_slice(&mut key);
    let _timestamp = buf.get_u32_le();
    let _duration = buf.get_u32_le();
    let name_len = buf.get_u32_le() as usize;
    let value_len = buf.get_u32_le() as usize;
    if ENTRY_HEADER_SIZE + name_len + value_len > len {
        return Err(HistError::Corruption(format!(
            "level-0 entry at {pos} overflows its length"
        )));
    }
    Ok(Some(EntryHeader {
        len,
        key: Key(key),
        name_len,
        value_len,
    }))
}

/// Walk the entry run of an unfinished file. Returns every `(key,
/// position)` pair ordered by key then position, and the cursor just past
/// the last entry. A malformed tail ends the scan.
pub(crate) fn scan_entries(data: &[u8]) -> (Vec<(Key, u32)>, u32) {
    let limit = data.len().min(L0_DATA_SIZE);
    let data = &data[..limit];
    let mut entries = Vec::new();
    let mut pos = FILE_HEADER_SIZE;
    loop {
        match decode_entry(data, pos) {
            Ok(Some(h)) => {
                entries.push((h.key, pos as u32));
                pos += h.len;
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(
                    position = pos,
                    error = %err,
                    "truncating level-0 at malformed entry"
                );
                break;
            }
        }
    }
    entries.sort_unstable();
    (entries, pos as u32)
}
