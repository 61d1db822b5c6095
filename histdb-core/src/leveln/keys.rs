//! Static B+ tree over fixed-size key entries.
//!
//! Pages are written strictly append-only, children before parents, so the
//! root is always the last page of the file. Leaves are doubly linked; the
//! `next` id of a leaf is known when it is written because exactly the run
//! of full ancestors above it is flushed between it and the following leaf.

use super::SpanOffset;
use crate::config::{KEY_ENTRY_SIZE, KEY_PAGE_HEADER_SIZE, KEY_PAGE_SIZE};
use crate::error::io_context;
use crate::types::Key;
use crate::{HistError, Result};
use bytes::{Buf, BufMut};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Entries that fit in one page
pub const ENTRIES_PER_PAGE: usize = (KEY_PAGE_SIZE - KEY_PAGE_HEADER_SIZE) / KEY_ENTRY_SIZE;

/// Page id of "no page"
pub const NO_PAGE: u64 = u64::MAX;

/// Interior entries reuse the offset field as a child page number
fn page_pointer(child: u64) -> Result<SpanOffset> {
    SpanOffset::try_from(child).map_err(|_| {
        HistError::InvalidPage(format!("child page {child} does not fit an entry offset"))
    })
}

/// One key-file entry. In interior pages `offset` holds the child page id
/// and `spans` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: Key,
    pub offset: SpanOffset,
    /// Length of the value span in 256-byte units
    pub spans: u8,
}

impl KeyEntry {
    fn encode(&self, out: &mut impl BufMut) {
        out.put_slice(self.key.as_bytes());
        out.put_u32_le(self.offset);
        out.put_u8(self.spans);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let mut key = [0u8; 32];
        buf.copy_to_slice(&mut key);
        Self {
            key: Key(key),
            offset: buf.get_u32_le(),
            spans: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageHeader {
    next: u64,
    prev: u64,
    count: u32,
    leaf: bool,
    depth: u8,
}

impl PageHeader {
    fn encode(&self, out: &mut impl BufMut) {
        out.put_u64_le(self.next);
        out.put_u64_le(self.prev);
        out.put_u32_le(self.count);
        out.put_u8(self.leaf as u8);
        out.put_u8(self.depth);
        out.put_bytes(0, KEY_PAGE_HEADER_SIZE - 22);
    }

    fn decode(mut buf: &[u8]) -> Self {
        Self {
            next: buf.get_u64_le(),
            prev: buf.get_u64_le(),
            count: buf.get_u32_le(),
            leaf: buf.get_u8() != 0,
            depth: buf.get_u8(),
        }
    }
}

/// Streaming writer; keys must arrive in non-decreasing order
pub struct KeyWriter {
    path: PathBuf,
    out: BufWriter<File>,
    /// Open page per depth; index 0 is the leaf level
    open: Vec<Vec<KeyEntry>>,
    /// Pages flushed so far at each depth
    flushed: Vec<u64>,
    pages: u64,
    last_leaf: u64,
    last_key: Option<Key>,
    entries: u64,
}

impl KeyWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| io_context(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::with_capacity(4 * KEY_PAGE_SIZE, file),
            open: vec![Vec::with_capacity(ENTRIES_PER_PAGE)],
            flushed: vec![0],
            pages: 0,
            last_leaf: NO_PAGE,
            last_key: None,
            entries: 0,
        })
    }

    /// Number of entries added
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn add(&mut self, entry: KeyEntry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if entry.key.compare(last) == Ordering::Less {
                return Err(HistError::InvalidFormat(format!(
                    "key {:?} added after {:?}",
                    entry.key, last
                )));
            }
        }
        self.last_key = Some(entry.key);
        self.entries += 1;

        if self.open[0].len() == ENTRIES_PER_PAGE {
            // ancestors that are full get flushed right after this leaf
            let full = self.open[1..]
                .iter()
                .take_while(|p| p.len() == ENTRIES_PER_PAGE)
                .count() as u64;
            let (id, first) = self.flush_leaf(self.pages + 1 + full)?;
            self.promote(1, first, id)?;
        }
        self.open[0].push(entry);
        Ok(())
    }

    fn flush_leaf(&mut self, next: u64) -> Result<(u64, Key)> {
        let header = PageHeader {
            next,
            prev: self.last_leaf,
            count: self.open[0].len() as u32,
            leaf: true,
            depth: 0,
        };
        let flushed = self.write_page(header, 0)?;
        self.last_leaf = flushed.0;
        Ok(flushed)
    }

    fn flush_interior(&mut self, depth: usize) -> Result<(u64, Key)> {
        let header = PageHeader {
            next: NO_PAGE,
            prev: NO_PAGE,
            count: self.open[depth].len() as u32,
            leaf: false,
            depth: depth as u8,
        };
        self.write_page(header, depth)
    }

    /// Write the open page at `depth`; returns its id and first key
    fn write_page(&mut self, header: PageHeader, depth: usize) -> Result<(u64, Key)> {
        let mut page = Vec::with_capacity(KEY_PAGE_SIZE);
        header.encode(&mut page);
        for e in &self.open[depth] {
            e.encode(&mut page);
        }
        page.resize(KEY_PAGE_SIZE, 0);
        self.out
            .write_all(&page)
            .map_err(|e| io_context(&self.path, e))?;

        let id = self.pages;
        let first = self.open[depth].first().map(|e| e.key).unwrap_or_default();
        self.open[depth].clear();
        self.flushed[depth] += 1;
        self.pages += 1;
        Ok((id, first))
    }

    /// Insert a pointer to page `child` into the open page at `depth`
    fn promote(&mut self, depth: usize, first: Key, child: u64) -> Result<()> {
        if depth == self.open.len() {
            self.open.push(Vec::with_capacity(ENTRIES_PER_PAGE));
            self.flushed.push(0);
        }
        if self.open[depth].len() == ENTRIES_PER_PAGE {
            let (id, up) = self.flush_interior(depth)?;
            self.promote(depth + 1, up, id)?;
        }
        self.open[depth].push(KeyEntry {
            key: first,
            offset: page_pointer(child)?,
            spans: 0,
        });
        Ok(())
    }

    /// Flush every open page bottom-up and sync. Returns the page count; the
    /// root is the last page.
    pub fn finish(mut self) -> Result<u64> {
        let (mut id, mut first) = self.flush_leaf(NO_PAGE)?;
        if self.open.len() > 1 || self.flushed[0] > 1 {
            let mut depth = 1;
            loop {
                self.promote(depth, first, id)?;
                let root = depth + 1 == self.open.len() && self.flushed[depth] == 0;
                (id, first) = self.flush_interior(depth)?;
                if root {
                    break;
                }
                depth += 1;
            }
        }
        self.out.flush().map_err(|e| io_context(&self.path, e))?;
        let file = self
            .out
            .into_inner()
            .map_err(|e| io_context(&self.path, e.into_error()))?;
        file.sync_all().map_err(|e| io_context(&self.path, e))?;
        Ok(self.pages)
    }
}

#[derive(Debug, Clone)]
struct Page {
    id: u64,
    header: PageHeader,
    body: Vec<u8>,
}

impl Page {
    fn entry(&self, i: usize) -> KeyEntry {
        let at = KEY_PAGE_HEADER_SIZE + i * KEY_ENTRY_SIZE;
        KeyEntry::decode(&self.body[at..at + KEY_ENTRY_SIZE])
    }

    fn len(&self) -> usize {
        self.header.count as usize
    }

    /// Number of entries with key < `key`
    fn lower_bound(&self, key: &Key) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        let prefix = key.prefix();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let e = self.entry(mid);
            let less = match e.key.prefix().cmp(&prefix) {
                Ordering::Equal => e.key.compare(key) == Ordering::Less,
                ord => ord == Ordering::Less,
            };
            if less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Number of entries with key <= `key`
    fn upper_bound(&self, key: &Key) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.entry(mid).key.compare(key) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// Reader with a one-page-per-depth cache
pub struct KeyReader {
    path: PathBuf,
    file: File,
    pages: u64,
    root: u64,
    depth: usize,
    cache: Vec<Option<Page>>,
}

impl KeyReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| io_context(&path, e))?;
        let len = file.metadata().map_err(|e| io_context(&path, e))?.len();
        if len == 0 || len % KEY_PAGE_SIZE as u64 != 0 {
            return Err(HistError::InvalidPage(format!(
                "{}: size {len} is not a whole number of pages",
                path.display()
            )));
        }
        let pages = len / KEY_PAGE_SIZE as u64;
        let mut reader = Self {
            path,
            file,
            pages,
            root: pages - 1,
            depth: 0,
            cache: Vec::new(),
        };
        let root = reader.read_page(reader.root)?;
        reader.depth = root.header.depth as usize;
        if root.header.leaf != (reader.depth == 0) {
            return Err(HistError::InvalidPage(format!(
                "{}: root leaf flag disagrees with depth",
                reader.path.display()
            )));
        }
        reader.cache = vec![None; reader.depth + 1];
        reader.cache[reader.depth] = Some(root);
        Ok(reader)
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| io_context(&self.path, e))
    }

    fn read_page(&self, id: u64) -> Result<Page> {
        if id >= self.pages {
            return Err(HistError::CorruptKeyReader(format!(
                "{}: page {id} beyond {} pages",
                self.path.display(),
                self.pages
            )));
        }
        let mut body = vec![0u8; KEY_PAGE_SIZE];
        self.file
            .read_exact_at(&mut body, id * KEY_PAGE_SIZE as u64)
            .map_err(|e| io_context(&self.path, e))?;
        let header = PageHeader::decode(&body);
        if header.count as usize > ENTRIES_PER_PAGE {
            return Err(HistError::InvalidPage(format!(
                "{}: page {id} claims {} entries",
                self.path.display(),
                header.count
            )));
        }
        Ok(Page { id, header, body })
    }

    /// Page `id` at `depth`, through the cache
    fn page(&mut self, id: u64, depth: usize) -> Result<&Page> {
        let hit = matches!(&self.cache[depth], Some(p) if p.id == id);
        if !hit {
            let page = self.read_page(id)?;
            if page.header.depth as usize != depth || page.header.leaf != (depth == 0) {
                return Err(HistError::InvalidPage(format!(
                    "{}: page {id} found at depth {depth} has depth {}",
                    self.path.display(),
                    page.header.depth
                )));
            }
            self.cache[depth] = Some(page);
        }
        self.cache[depth]
            .as_ref()
            .ok_or_else(|| HistError::CorruptKeyReader("page cache miss".into()))
    }

    /// Walk interior pages to a leaf. With `strict` the walk follows the last
    /// child whose first key is `< key`, otherwise `<= key`.
    fn descend(&mut self, key: &Key, strict: bool) -> Result<u64> {
        let mut id = self.root;
        for depth in (1..=self.depth).rev() {
            let page = self.page(id, depth)?;
            if page.len() == 0 {
                return Err(HistError::CorruptKeyReader(format!(
                    "empty interior page {id}"
                )));
            }
            let bound = if strict {
                page.lower_bound(key)
            } else {
                page.upper_bound(key)
            };
            id = page.entry(bound.saturating_sub(1)).offset as u64;
        }
        Ok(id)
    }

    /// First entry with key `>= key`
    pub fn lower_bound(&mut self, key: &Key) -> Result<Option<KeyEntry>> {
        let leaf = self.descend(key, true)?;
        let page = self.page(leaf, 0)?;
        let i = page.lower_bound(key);
        if i < page.len() {
            return Ok(Some(page.entry(i)));
        }
        let next = page.header.next;
        if next == NO_PAGE {
            return Ok(None);
        }
        let page = self.page(next, 0)?;
        Ok((page.len() > 0).then(|| page.entry(0)))
    }

    /// Last entry with key `<= key`
    pub fn floor(&mut self, key: &Key) -> Result<Option<KeyEntry>> {
        let leaf = self.descend(key, false)?;
        let page = self.page(leaf, 0)?;
        let i = page.upper_bound(key);
        if i > 0 {
            return Ok(Some(page.entry(i - 1)));
        }
        let prev = page.header.prev;
        if prev == NO_PAGE {
            return Ok(None);
        }
        let page = self.page(prev, 0)?;
        Ok(page.len().checked_sub(1).map(|i| page.entry(i)))
    }

    /// Exact lookup
    pub fn get(&mut self, key: &Key) -> Result<Option<KeyEntry>> {
        Ok(self.lower_bound(key)?.filter(|e| e.key == *key))
    }

    /// Every leaf entry in key order
    pub fn entries(&mut self) -> Result<Vec<KeyEntry>> {
        let mut id = self.descend(&Key::default(), true)?;
        let mut out = Vec::new();
        loop {
            let page = self.page(id, 0)?;
            out.extend((0..page.len()).map(|i| page.entry(i)));
            if page.header.next == NO_PAGE {
                return Ok(out);
            }
            id = page.header.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricHash;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn key(i: u32) -> Key {
        let mut h = [0u8; 24];
        h[..4].copy_from_slice(&(i / 3).to_be_bytes());
        Key::new(&MetricHash(h), i % 3, 0)
    }

    fn build(dir: &TempDir, n: u32) -> (PathBuf, Vec<KeyEntry>) {
        let path = dir.path().join("keys");
        let mut w = KeyWriter::create(&path).unwrap();
        let entries: Vec<KeyEntry> = (0..n)
            .map(|i| KeyEntry {
                key: key(i * 2),
                offset: i,
                spans: (i % 8) as u8 + 1,
            })
            .collect();
        for e in &entries {
            w.add(*e).unwrap();
        }
        let pages = w.finish().unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            pages * KEY_PAGE_SIZE as u64
        );
        (path, entries)
    }

    #[test]
    fn test_page_pointer_range() {
        assert_eq!(page_pointer(7).unwrap(), 7);
        assert_eq!(page_pointer(u32::MAX as u64).unwrap(), u32::MAX);
        assert!(matches!(
            page_pointer(u32::MAX as u64 + 1),
            Err(HistError::InvalidPage(_))
        ));
    }

    #[test]
    fn test_page_capacity() {
        assert_eq!(ENTRIES_PER_PAGE, 442);
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let (path, _) = build(&dir, 0);
        let mut r = KeyReader::open(&path).unwrap();
        assert_eq!(r.pages(), 1);
        assert_eq!(r.lower_bound(&key(0)).unwrap(), None);
        assert_eq!(r.floor(&key(0)).unwrap(), None);
    }

    #[test]
    fn test_every_key_found() {
        let dir = TempDir::new().unwrap();
        for n in [1, 441, 442, 443, 442 * 442 + 5] {
            let (path, entries) = build(&dir, n);
            let mut r = KeyReader::open(&path).unwrap();
            for e in entries.iter().step_by(97) {
                assert_eq!(r.get(&e.key).unwrap(), Some(*e), "n={n}");
            }
            assert_eq!(r.get(&entries[entries.len() - 1].key).unwrap(), entries.last().copied());
            assert_eq!(r.entries().unwrap(), entries, "n={n}");
            std::fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn test_depth_grows() {
        let dir = TempDir::new().unwrap();
        let (path, _) = build(&dir, 442 * 442 + 5);
        let r = KeyReader::open(&path).unwrap();
        assert_eq!(r.depth(), 2);
    }

    #[test]
    fn test_bounds_between_keys() {
        let dir = TempDir::new().unwrap();
        let (path, entries) = build(&dir, 2000);
        let mut r = KeyReader::open(&path).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for _ in 0..500 {
            let i = rng.gen_range(0..2000u32);
            let probe = key(i * 2 + 1);
            let lb = r.lower_bound(&probe).unwrap();
            let fl = r.floor(&probe).unwrap();
            let expect_lb = entries.iter().find(|e| e.key > probe).copied();
            let expect_fl = entries.iter().rev().find(|e| e.key <= probe).copied();
            assert_eq!(lb, expect_lb);
            assert_eq!(fl, expect_fl);
        }
        assert_eq!(r.floor(&Key::default()).unwrap(), None);
        assert_eq!(r.lower_bound(&Key([0xff; 32])).unwrap(), None);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let dir = TempDir::new().unwrap();
        let mut w = KeyWriter::create(dir.path().join("k")).unwrap();
        w.add(KeyEntry { key: key(5), offset: 0, spans: 1 }).unwrap();
        assert!(w.add(KeyEntry { key: key(1), offset: 0, spans: 1 }).is_err());
    }

    #[test]
    fn test_truncated_file_is_invalid_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(KeyReader::open(&path), Err(HistError::InvalidPage(_))));
    }
}
