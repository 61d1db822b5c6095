//! Read side of a level-0 file, finished or recovered

use super::{decode_entry, scan_entries, FileHeader, FILE_HEADER_SIZE};
use crate::config::{L0_DATA_SIZE, L0_ENTRY_ALIGN};
use crate::error::io_context;
use crate::merge::KeyIterator;
use crate::types::Key;
use crate::{HistError, Result};
use bytes::Buf;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub key: Key,
    pub name: &'a [u8],
    pub value: &'a [u8],
}

/// In-memory view of a level-0 file. The data area is at most 2 MiB, so it
/// is loaded whole.
pub struct Level0Reader {
    path: PathBuf,
    data: Vec<u8>,
    /// `(key, position)` ordered by key then position
    entries: Vec<(Key, u32)>,
    finished: bool,
}

impl Level0Reader {
    /// Open a level-0. A finished file is read through its index; an
    /// unfinished one is recovered by scanning its entries.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = std::fs::read(&path).map_err(|e| io_context(&path, e))?;
        let header = FileHeader::decode(&data)?;

        let entries = if header.finished {
            let cursor = header.cursor as usize;
            if cursor < FILE_HEADER_SIZE || cursor > L0_DATA_SIZE {
                return Err(HistError::Corruption(format!(
                    "{}: cursor {cursor} outside data area",
                    path.display()
                )));
            }
            let index_len = header.slots as usize * 2;
            let Some(mut index) = data.get(L0_DATA_SIZE..L0_DATA_SIZE + index_len) else {
                return Err(HistError::short(L0_DATA_SIZE + index_len, data.len()));
            };
            let area = &data[..cursor];
            let mut entries = Vec::with_capacity(header.slots as usize);
            while index.has_remaining() {
                let pos = index.get_u16_le() as usize * L0_ENTRY_ALIGN;
                if pos < FILE_HEADER_SIZE {
                    return Err(HistError::Corruption(format!(
                        "{}: index slot points at the file header",
                        path.display()
                    )));
                }
                let Some(h) = decode_entry(area, pos)? else {
                    return Err(HistError::Corruption(format!(
                        "{}: index slot {pos} points past the data",
                        path.display()
                    )));
                };
                if let Some((prev, prev_pos)) = entries.last() {
                    let ord = h.key.compare(prev).then((pos as u32).cmp(prev_pos));
                    if ord != Ordering::Greater {
                        return Err(HistError::Corruption(format!(
                            "{}: index out of order",
                            path.display()
                        )));
                    }
                }
                entries.push((h.key, pos as u32));
            }
            data.truncate(cursor);
            entries
        } else {
            let (entries, cursor) = scan_entries(&data);
            data.truncate(cursor as usize);
            entries
        };

        debug!(
            path = %path.display(),
            entries = entries.len(),
            finished = header.finished,
            "opened level-0"
        );
        Ok(Self {
            path,
            data,
            entries,
            finished: header.finished,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_at(&self, i: usize) -> Result<Entry<'_>> {
        let (key, pos) = self.entries[i];
        let pos = pos as usize;
        let h = decode_entry(&self.data, pos)?
            .ok_or_else(|| HistError::Corruption(format!("level-0 entry {i} vanished")))?;
        let name_at = pos + super::ENTRY_HEADER_SIZE;
        let value_at = name_at + h.name_len;
        Ok(Entry {
            key,
            name: &self.data[name_at..value_at],
            value: &self.data[value_at..value_at + h.value_len],
        })
    }

    /// Index of the first key `>= key`
    pub fn lower_bound(&self, key: &Key) -> usize {
        self.entries
            .partition_point(|(k, _)| k.compare(key) == Ordering::Less)
    }

    /// Values stored under exactly `key`, oldest first. Stops at the first
    /// unreadable entry.
    pub fn values<'a>(&'a self, key: &'a Key) -> impl Iterator<Item = &'a [u8]> + 'a {
        let start = self.lower_bound(key);
        self.entries[start..]
            .iter()
            .take_while(move |(k, _)| k == key)
            .enumerate()
            .map_while(move |(i, _)| self.entry_at(start + i).ok())
            .map(|e| e.value)
    }

    /// Iterate in key order
    pub fn iter(&self) -> Level0Iter<'_> {
        self.iter_from(0)
    }

    /// Iterate from the first key `>= key`
    pub fn seek(&self, key: &Key) -> Level0Iter<'_> {
        self.iter_from(self.lower_bound(key))
    }

    fn iter_from(&self, next: usize) -> Level0Iter<'_> {
        Level0Iter {
            reader: self,
            next,
            key: Key::default(),
            name: &[],
            value: &[],
        }
    }

    /// All entries in key order. An unreadable entry is reported once and
    /// ends the iteration.
    pub fn entries(&self) -> impl Iterator<Item = Result<Entry<'_>>> {
        let mut failed = false;
        (0..self.entries.len()).map_while(move |i| {
            if failed {
                return None;
            }
            let entry = self.entry_at(i);
            if let Err(err) = &entry {
                warn!(
                    path = %self.path.display(),
                    entry = i,
                    error = %err,
                    "level-0 entry unreadable"
                );
                failed = true;
            }
            Some(entry)
        })
    }
}

/// Cursor over a [`Level0Reader`]
pub struct Level0Iter<'a> {
    reader: &'a Level0Reader,
    next: usize,
    key: Key,
    name: &'a [u8],
    value: &'a [u8],
}

impl<'a> Level0Iter<'a> {
    pub fn name(&self) -> &'a [u8] {
        self.name
    }
}

impl KeyIterator for Level0Iter<'_> {
    fn next(&mut self) -> Result<bool> {
        if self.next >= self.reader.entries.len() {
            return Ok(false);
        }
        let e = self.reader.entry_at(self.next)?;
        self.next += 1;
        self.key = e.key;
        self.name = e.name;
        self.value = e.value;
        Ok(true)
    }

    fn key(&self) -> &Key {
        &self.key
    }

    fn value(&self) -> &[u8] {
        self.value
    }
}
