//! Level-N: an immutable triple of tag-index, key and value files covering a
//! range of level-0 generations.

mod keys;
mod values;

pub use keys::{KeyEntry, KeyReader, KeyWriter, ENTRIES_PER_PAGE, NO_PAGE};
pub use values::{ValueIter, ValueWriter, MAX_VALUE_LEN};

use crate::atomicdir::{FileKind, FileName};
use crate::error::io_context;
use crate::merge::KeyIterator;
use crate::tags::TagIndex;
use crate::types::{GenRange, Key, MetricHash};
use crate::{HistError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Offset into a value file in 256-byte units. Widen here if value files
/// ever need to pass 1 TiB.
pub type SpanOffset = u32;

/// Paths of the three files of one level-N
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPaths {
    pub index: PathBuf,
    pub keys: PathBuf,
    pub values: PathBuf,
}

impl LevelPaths {
    /// The conventional file names for `range` inside `dir`
    pub fn in_dir(dir: &Path, range: GenRange) -> Self {
        let name = |kind| dir.join(FileName::level_n(range, kind).to_string());
        Self {
            index: name(FileKind::MemIndex),
            keys: name(FileKind::Keys),
            values: name(FileKind::Values),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.index, &self.keys, &self.values]
    }
}

/// Streams sorted `(key, value)` pairs into a new level-N
pub struct LevelWriter {
    paths: LevelPaths,
    range: GenRange,
    keys: KeyWriter,
    values: ValueWriter,
    /// Keys stored in the open span
    pending: Vec<Key>,
    hash: Option<MetricHash>,
    written: u64,
}

impl LevelWriter {
    pub fn create(paths: LevelPaths, range: GenRange) -> Result<Self> {
        let keys = KeyWriter::create(&paths.keys)?;
        let values = ValueWriter::create(&paths.values)?;
        Ok(Self {
            paths,
            range,
            keys,
            values,
            pending: Vec::new(),
            hash: None,
            written: 0,
        })
    }

    /// Entries added so far
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Append one entry; keys must arrive in non-decreasing order. Returns
    /// [`HistError::ValueTooLarge`] without side effects when `value` can
    /// never fit a span.
    pub fn add(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        if value.len() > MAX_VALUE_LEN {
            return Err(HistError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        let hash = key.hash();
        if self.hash != Some(hash) || !self.values.can_append(value.len()) {
            self.close_span()?;
            self.values.begin_span(&hash)?;
            self.hash = Some(hash);
        }
        self.values.append(key.timestamp(), key.duration(), value)?;
        self.pending.push(*key);
        self.written += 1;
        Ok(())
    }

    fn close_span(&mut self) -> Result<()> {
        if !self.values.has_open_span() {
            return Ok(());
        }
        let (offset, spans) = self.values.finish_span()?;
        for key in self.pending.drain(..) {
            self.keys.add(KeyEntry { key, offset, spans })?;
        }
        Ok(())
    }

    /// Write the remaining span, the key tree and `index`, and sync all
    /// three files
    pub fn finish(mut self, index: &TagIndex) -> Result<()> {
        self.close_span()?;
        let pages = self.keys.finish()?;
        let bytes = self.values.finish()?;
        write_synced(&self.paths.index, &index.to_bytes()?)?;
        debug!(
            range = %self.range,
            entries = self.written,
            pages,
            value_bytes = bytes,
            "wrote level-n"
        );
        Ok(())
    }
}

pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| io_context(path, e))?;
    file.write_all(bytes).map_err(|e| io_context(path, e))?;
    file.sync_all().map_err(|e| io_context(path, e))
}

/// An open level-N
pub struct LevelN {
    range: GenRange,
    paths: LevelPaths,
    index: TagIndex,
    keys: Mutex<KeyReader>,
    index_file: File,
    values: File,
}

impl LevelN {
    pub fn open(paths: LevelPaths, range: GenRange) -> Result<Self> {
        let index_file = File::open(&paths.index).map_err(|e| io_context(&paths.index, e))?;
        let bytes = std::fs::read(&paths.index).map_err(|e| io_context(&paths.index, e))?;
        let index = TagIndex::from_bytes(&bytes)?;
        let keys = KeyReader::open(&paths.keys)?;
        let values = File::open(&paths.values).map_err(|e| io_context(&paths.values, e))?;
        debug!(range = %range, metrics = index.cardinality(), "opened level-n");
        Ok(Self {
            range,
            paths,
            index,
            keys: Mutex::new(keys),
            index_file,
            values,
        })
    }

    pub fn range(&self) -> GenRange {
        self.range
    }

    pub fn depth(&self) -> u32 {
        self.range.depth()
    }

    pub fn paths(&self) -> &LevelPaths {
        &self.paths
    }

    /// Point at the same files under another directory (after hard-linking
    /// them into a new transaction)
    pub(crate) fn rebase(&mut self, dir: &Path) {
        self.paths = LevelPaths::in_dir(dir, self.range);
    }

    /// Snapshot of the tag index this level was written with
    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    /// Every entry in key order
    pub fn iter(&self) -> Result<ValueIter<'_>> {
        ValueIter::new(&self.values, &self.paths.values, 0)
    }

    /// Iterator whose first entry is the first key `>= key`
    pub fn seek(&self, key: &Key) -> Result<ValueIter<'_>> {
        let found = self.keys.lock().lower_bound(key)?;
        let mut it = match found {
            Some(entry) => ValueIter::new(&self.values, &self.paths.values, entry.offset)?,
            None => {
                let end = self
                    .values
                    .metadata()
                    .map_err(|e| io_context(&self.paths.values, e))?
                    .len();
                let end = SpanOffset::try_from(end / crate::config::VALUE_SPAN_ALIGN as u64)
                    .map_err(|_| HistError::InvalidSpan("value file too large".into()))?;
                return ValueIter::new(&self.values, &self.paths.values, end);
            }
        };
        it.seek(key)?;
        Ok(it)
    }

    /// Sync all three files, reporting the first failure
    pub fn sync(&self) -> Result<()> {
        let results = [
            self.index_file.sync_all().map_err(|e| io_context(&self.paths.index, e)),
            self.keys.lock().sync(),
            self.values.sync_all().map_err(|e| io_context(&self.paths.values, e)),
        ];
        results.into_iter().collect()
    }

    pub fn close(self) -> Result<()> {
        self.sync()
    }

    /// Close and unlink all three files. Every file is removed even if
    /// closing or an earlier removal failed.
    pub fn remove(self) -> Result<()> {
        let paths = self.paths.clone();
        let closed = self.close();
        let mut first = closed.err();
        for path in paths.all() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove level-n file");
                first.get_or_insert(io_context(path, e));
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Key;
    use tempfile::TempDir;

    fn key(h: u8, ts: u32) -> Key {
        Key::new(&MetricHash([h; 24]), ts, 0)
    }

    fn build(dir: &Path, items: &[(Key, Vec<u8>)]) -> LevelN {
        let range = GenRange::single(3);
        let paths = LevelPaths::in_dir(dir, range);
        let mut w = LevelWriter::create(paths.clone(), range).unwrap();
        for (k, v) in items {
            w.add(k, v).unwrap();
        }
        let mut index = TagIndex::new();
        index.add(b"a=1");
        w.finish(&index).unwrap();
        LevelN::open(paths, range).unwrap()
    }

    fn collect(mut it: ValueIter<'_>) -> Vec<(Key, Vec<u8>)> {
        let mut out = Vec::new();
        while it.next().unwrap() {
            out.push((*it.key(), it.value().to_vec()));
        }
        out
    }

    #[test]
    fn test_write_and_iterate() {
        let dir = TempDir::new().unwrap();
        let mut items = Vec::new();
        for h in 1..=20u8 {
            for ts in 0..5u32 {
                items.push((key(h, ts), vec![h; (ts as usize + 1) * 100]));
            }
        }
        let lv = build(dir.path(), &items);
        assert_eq!(lv.index().cardinality(), 1);
        assert_eq!(lv.depth(), 0);
        assert_eq!(collect(lv.iter().unwrap()), items);
    }

    #[test]
    fn test_hash_spills_over_several_spans() {
        let dir = TempDir::new().unwrap();
        let items: Vec<_> = (0..10u32).map(|ts| (key(7, ts), vec![1u8; 900])).collect();
        let lv = build(dir.path(), &items);
        let got = collect(lv.seek(&key(7, 4)).unwrap());
        assert_eq!(got, items[4..].to_vec());
    }

    #[test]
    fn test_seek() {
        let dir = TempDir::new().unwrap();
        let items = vec![
            (key(1, 0), b"a".to_vec()),
            (key(1, 2), b"b".to_vec()),
            (key(4, 0), b"c".to_vec()),
        ];
        let lv = build(dir.path(), &items);

        let mut it = lv.seek(&key(1, 1)).unwrap();
        assert!(it.next().unwrap());
        assert_eq!(it.value(), b"b");

        let mut it = lv.seek(&key(2, 0)).unwrap();
        assert!(it.next().unwrap());
        assert_eq!(*it.key(), key(4, 0));

        let mut it = lv.seek(&key(9, 0)).unwrap();
        assert!(!it.next().unwrap());
    }

    #[test]
    fn test_value_too_large_is_rejected() {
        let dir = TempDir::new().unwrap();
        let range = GenRange::single(0);
        let mut w = LevelWriter::create(LevelPaths::in_dir(dir.path(), range), range).unwrap();
        assert!(matches!(
            w.add(&key(1, 0), &vec![0u8; MAX_VALUE_LEN + 1]),
            Err(HistError::ValueTooLarge { .. })
        ));
        assert!(w.is_empty());
        w.add(&key(1, 0), &vec![0u8; MAX_VALUE_LEN]).unwrap();
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_remove_unlinks_all_files() {
        let dir = TempDir::new().unwrap();
        let lv = build(dir.path(), &[(key(1, 0), b"x".to_vec())]);
        let paths = lv.paths().clone();
        lv.sync().unwrap();
        lv.remove().unwrap();
        for p in paths.all() {
            assert!(!p.exists());
        }
    }
}
