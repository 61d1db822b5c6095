//! Single-writer append path for a level-0 file

use super::{encode_entry, entry_len, scan_entries, FileHeader, FILE_HEADER_SIZE, FILE_SIZE};
use crate::config::{L0_DATA_SIZE, L0_ENTRY_ALIGN};
use crate::error::io_context;
use crate::types::Key;
use crate::{HistError, Result};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pending bytes are written out once this much accumulates
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Outcome of [`Level0Writer::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Stored,
    /// The entry would cross the data area; the buffer has been finished
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Failed(String),
}

pub struct Level0Writer {
    path: PathBuf,
    file: File,
    pending: BytesMut,
    /// File offset of `pending[0]`
    pending_at: u64,
    cursor: usize,
    /// `(key, position)` of every entry, sorted on finish
    index: Vec<(Key, u32)>,
    state: State,
}

impl Level0Writer {
    /// Start a new level-0 at `path`. The file may not exist yet or may be
    /// a zero-filled preallocation; one with a header is refused.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_context(&path, e))?;
        let len = file.metadata().map_err(|e| io_context(&path, e))?.len();
        if len >= FILE_HEADER_SIZE as u64 {
            let mut head = [0u8; FILE_HEADER_SIZE];
            file.read_exact_at(&mut head, 0)
                .map_err(|e| io_context(&path, e))?;
            if head.iter().any(|b| *b != 0) {
                return Err(HistError::Level0Failed(format!(
                    "{} already holds a level-0",
                    path.display()
                )));
            }
        }
        file.set_len(FILE_SIZE)
            .map_err(|e| io_context(&path, e))?;

        let mut pending = BytesMut::with_capacity(FLUSH_THRESHOLD);
        FileHeader::default().encode(&mut pending);
        debug!(path = %path.display(), "created level-0");
        Ok(Self {
            path,
            file,
            pending,
            pending_at: 0,
            cursor: FILE_HEADER_SIZE,
            index: Vec::new(),
            state: State::Open,
        })
    }

    /// Reopen an unfinished level-0 and continue appending after its last
    /// intact entry
    pub fn resume(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_context(&path, e))?;
        let mut data = vec![0u8; L0_DATA_SIZE];
        file.read_exact_at(&mut data, 0)
            .map_err(|e| io_context(&path, e))?;
        let header = FileHeader::decode(&data)?;
        if header.finished {
            return Err(HistError::Level0Failed(format!(
                "{} is already finished",
                path.display()
            )));
        }

        let (index, cursor) = scan_entries(&data);
        // anything past the intact run is garbage from a torn write
        let tail = L0_DATA_SIZE - cursor as usize;
        if tail > 0 && data[cursor as usize..].iter().any(|b| *b != 0) {
            file.write_all_at(&vec![0u8; tail], cursor as u64)
                .map_err(|e| io_context(&path, e))?;
        }
        info!(path = %path.display(), entries = index.len(), cursor, "resumed level-0");

        Ok(Self {
            path,
            file,
            pending: BytesMut::with_capacity(FLUSH_THRESHOLD),
            pending_at: cursor as u64,
            cursor: cursor as usize,
            index,
            state: State::Open,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended so far
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Offset where the next entry goes
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    fn check_open(&self) -> Result<()> {
        match &self.state {
            State::Open => Ok(()),
            State::Finished => Err(HistError::Level0Failed(format!(
                "{} is finished",
                self.path.display()
            ))),
            State::Failed(msg) => Err(HistError::Level0Failed(msg.clone())),
        }
    }

    /// Record an I/O failure; the writer refuses all further work
    fn fail(&mut self, err: std::io::Error) -> HistError {
        let msg = format!("{}: {}", self.path.display(), err);
        tracing::error!(error = %msg, "level-0 write failed");
        self.state = State::Failed(msg.clone());
        HistError::Level0Failed(msg)
    }

    /// Append one entry. Returns [`Appended::Full`] (after finishing the
    /// buffer) when the entry would cross the data area, and keeps returning
    /// it once finished.
    pub fn append(&mut self, key: &Key, name: &[u8], value: &[u8]) -> Result<Appended> {
        if self.state == State::Finished {
            return Ok(Appended::Full);
        }
        self.check_open()?;
        debug_assert_eq!(self.cursor % L0_ENTRY_ALIGN, 0);

        let len = entry_len(name.len(), value.len());
        if self.cursor + len > L0_DATA_SIZE {
            self.finish()?;
            return Ok(Appended::Full);
        }

        let pos = self.cursor as u32;
        encode_entry(&mut self.pending, key, name, value);
        self.cursor += len;
        self.index.push((*key, pos));
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.write_pending()?;
        }
        Ok(Appended::Stored)
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all_at(&self.pending, self.pending_at) {
            return Err(self.fail(e));
        }
        self.pending_at += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Write buffered entries and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        self.write_pending()?;
        if let Err(e) = self.file.sync_data() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Write the tail, the sorted index and the finished header. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.check_open()?;
        self.write_pending()?;

        self.index.sort_unstable();
        let mut index = BytesMut::with_capacity(self.index.len() * 2);
        for (_, pos) in &self.index {
            index.put_u16_le((*pos as usize / L0_ENTRY_ALIGN) as u16);
        }
        let slots = self.index.len() as u32;
        let mut header = BytesMut::with_capacity(FILE_HEADER_SIZE);
        FileHeader {
            finished: true,
            slots,
            cursor: self.cursor as u32,
        }
        .encode(&mut header);

        let written = self
            .file
            .write_all_at(&index, L0_DATA_SIZE as u64)
            .and_then(|_| self.file.write_all_at(&header, 0))
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            return Err(self.fail(e));
        }
        self.state = State::Finished;
        info!(
            path = %self.path.display(),
            entries = slots,
            bytes = self.cursor,
            "finished level-0"
        );
        Ok(())
    }

    /// Flush what is buffered without finishing, leaving the file resumable
    pub fn close(mut self) -> Result<()> {
        match self.state {
            State::Open => self.sync(),
            _ => Ok(()),
        }
    }

    /// Re-read the entry header at `pos`; used by tests and recovery checks
    #[cfg(test)]
    fn header_at(&self, pos: u32) -> Result<Option<super::EntryHeader>> {
        let mut data = vec![0u8; L0_DATA_SIZE];
        self.file.read_exact_at(&mut data, 0)?;
        super::decode_entry(&data, pos as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level0::Level0Reader;
    use crate::types::MetricHash;
    use tempfile::TempDir;

    fn key(n: u8, ts: u32) -> Key {
        Key::new(&MetricHash([n; 24]), ts, 0)
    }

    #[test]
    fn test_append_and_finish() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("l0");
        let mut w = Level0Writer::create(&path).unwrap();
        assert_eq!(w.append(&key(2, 0), b"b", b"x").unwrap(), Appended::Stored);
        assert_eq!(w.append(&key(1, 0), b"a", b"y").unwrap(), Appended::Stored);
        assert_eq!(w.append(&key(2, 0), b"b", b"zz").unwrap(), Appended::Stored);
        assert_eq!(w.len(), 3);
        w.finish().unwrap();
        assert!(w.is_finished());
        assert_eq!(w.append(&key(3, 0), b"c", b"").unwrap(), Appended::Full);
        assert_eq!(w.len(), 3);

        let r = Level0Reader::open(&path).unwrap();
        assert_eq!(r.len(), 3);
        let all: Vec<_> = r.entries().map(|e| e.unwrap()).collect();
        assert_eq!(all[0].name, b"a");
        let k = key(2, 0);
        let values: Vec<&[u8]> = r.values(&k).collect();
        assert_eq!(values, vec![&b"x"[..], &b"zz"[..]]);
    }

    #[test]
    fn test_full_exactly_at_data_boundary() {
        let dir = TempDir::new().unwrap();
        let mut w = Level0Writer::create(dir.path().join("l0")).unwrap();
        let value = vec![7u8; 1024 - 52];
        assert_eq!(entry_len(0, value.len()), 1024);

        // header + 2047 entries leaves 992 bytes: one more 1024 entry does not fit
        let fits = (L0_DATA_SIZE - FILE_HEADER_SIZE) / 1024;
        for i in 0..fits {
            assert_eq!(
                w.append(&key(1, i as u32), b"", &value).unwrap(),
                Appended::Stored
            );
        }
        let small = vec![0u8; 992 - 52];
        assert_eq!(w.append(&key(2, 0), b"", &small).unwrap(), Appended::Stored);
        assert_eq!(w.cursor(), L0_DATA_SIZE);
        assert_eq!(w.append(&key(3, 0), b"", b"").unwrap(), Appended::Full);
        assert!(w.is_finished());
        // late appenders see the same answer instead of an error
        assert_eq!(w.append(&key(4, 0), b"", b"").unwrap(), Appended::Full);
    }

    #[test]
    fn test_resume_continues_after_last_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("l0");
        let mut w = Level0Writer::create(&path).unwrap();
        w.append(&key(1, 0), b"a", b"1").unwrap();
        w.append(&key(2, 0), b"b", b"2").unwrap();
        let cursor = w.cursor();
        w.close().unwrap();

        let mut w = Level0Writer::resume(&path).unwrap();
        assert_eq!(w.cursor(), cursor);
        assert_eq!(w.len(), 2);
        w.append(&key(1, 0), b"a", b"111").unwrap();
        w.sync().unwrap();
        assert_eq!(w.header_at(cursor as u32).unwrap().unwrap().key, key(1, 0));
        w.finish().unwrap();

        let r = Level0Reader::open(&path).unwrap();
        assert_eq!(r.len(), 3);
        let k = key(1, 0);
        let values: Vec<&[u8]> = r.values(&k).collect();
        assert_eq!(values, vec![&b"1"[..], &b"111"[..]]);
    }

    #[test]
    fn test_create_over_preallocation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("l0");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(FILE_SIZE)
            .unwrap();
        let mut w = Level0Writer::create(&path).unwrap();
        w.append(&key(1, 0), b"a", b"1").unwrap();
        w.sync().unwrap();
        drop(w);
        assert!(matches!(
            Level0Writer::create(&path),
            Err(HistError::Level0Failed(_))
        ));
    }

    #[test]
    fn test_resume_rejects_finished() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("l0");
        let mut w = Level0Writer::create(&path).unwrap();
        w.finish().unwrap();
        assert!(matches!(
            Level0Writer::resume(&path),
            Err(HistError::Level0Failed(_))
        ));
    }
}
