//! Crash-consistent directory transitions.
//!
//! Every state of the store lives in its own subdirectory named by an
//! 8-digit hex id. The symlink `current` names the live one. A transition
//! builds the next directory (preallocating new files and hard-linking the
//! ones carried over), then swaps `current` with a rename, which is atomic:
//! a reader sees either the old or the new directory, never a mix.

mod name;

pub use name::{FileKind, FileName, LegacyName, FILE_NAME_LEN};

use crate::error::io_context;
use crate::hex;
use crate::types::GenRange;
use crate::{HistError, Result};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CURRENT: &str = "current";
const CURRENT_NEXT: &str = "current-next";

fn dir_name(id: u32) -> String {
    String::from_utf8_lossy(&hex::put32(id)).into_owned()
}

fn parse_dir_name(name: &str) -> Option<u32> {
    hex::get32(name.as_bytes())
}

fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_context(path, e))
}

/// One file of a transaction directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnFile {
    pub name: FileName,
    /// Name on disk; differs from `name` only for legacy names
    pub file: String,
}

impl TxnFile {
    pub fn is_legacy(&self) -> bool {
        self.file != self.name.to_string()
    }
}

/// A populated transaction directory
#[derive(Debug, Clone)]
pub struct Txn {
    id: u32,
    dir: PathBuf,
    files: Vec<TxnFile>,
}

impl Txn {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files sorted by generation (newest first), then level and kind
    pub fn files(&self) -> &[TxnFile] {
        &self.files
    }

    pub fn path(&self, file: &TxnFile) -> PathBuf {
        self.dir.join(&file.file)
    }

    /// Generations of the level-0 buffers, oldest first
    pub fn level0s(&self) -> Vec<u32> {
        let mut gens: Vec<u32> = self
            .files
            .iter()
            .filter(|f| f.name.kind == FileKind::Level0)
            .map(|f| f.name.gen.low)
            .collect();
        gens.sort_unstable();
        gens
    }

    /// Generation ranges of the level-Ns, oldest first
    pub fn levels(&self) -> Vec<GenRange> {
        let mut ranges: Vec<GenRange> = self
            .files
            .iter()
            .filter(|f| f.name.kind == FileKind::MemIndex)
            .map(|f| f.name.gen)
            .collect();
        ranges.sort_unstable();
        ranges
    }

    pub fn has_legacy_names(&self) -> bool {
        self.files.iter().any(TxnFile::is_legacy)
    }
}

/// Declares the files of a directory under construction
pub struct DirBuilder<'a> {
    dir: &'a Path,
    files: Vec<TxnFile>,
}

impl DirBuilder<'_> {
    pub fn dir(&self) -> &Path {
        self.dir
    }

    fn declare(&mut self, name: FileName) -> PathBuf {
        let file = name.to_string();
        let path = self.dir.join(&file);
        self.files.push(TxnFile { name, file });
        path
    }

    /// Create `name` preallocated to `len` zero bytes
    pub fn allocate(&mut self, name: FileName, len: u64) -> Result<PathBuf> {
        let path = self.declare(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| io_context(&path, e))?;
        file.set_len(len).map_err(|e| io_context(&path, e))?;
        Ok(path)
    }

    /// Hard-link a file of an existing transaction into this one, under its
    /// canonical name
    pub fn include(&mut self, from: &Txn, file: &TxnFile) -> Result<PathBuf> {
        let src = from.path(file);
        let path = self.declare(file.name);
        fs::hard_link(&src, &path).map_err(|e| io_context(&src, e))?;
        Ok(path)
    }

    /// Declare a file the caller writes itself
    pub fn create(&mut self, name: FileName) -> PathBuf {
        self.declare(name)
    }
}

/// Manager of the transaction directories under one root
pub struct AtomicDir {
    root: PathBuf,
    last_id: Option<u32>,
    current: Option<u32>,
}

impl AtomicDir {
    /// Scan `root` (created if missing) for transaction directories and
    /// resolve `current`
    pub fn init(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_context(&root, e))?;

        let mut last_id = None;
        for entry in fs::read_dir(&root).map_err(|e| io_context(&root, e))? {
            let entry = entry.map_err(|e| io_context(&root, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_dir_name) {
                last_id = last_id.max(Some(id));
            }
        }

        let link = root.join(CURRENT);
        let current = match fs::read_link(&link) {
            Ok(target) => {
                let id = target.to_str().and_then(parse_dir_name).ok_or_else(|| {
                    HistError::InvalidDirectory(format!(
                        "{} points at {}",
                        link.display(),
                        target.display()
                    ))
                })?;
                if !root.join(&target).is_dir() {
                    return Err(HistError::InvalidDirectory(format!(
                        "{} points at missing directory {}",
                        link.display(),
                        target.display()
                    )));
                }
                Some(id)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                return Err(HistError::InvalidDirectory(format!(
                    "{} is not a symlink",
                    link.display()
                )))
            }
            Err(e) => return Err(io_context(&link, e)),
        };
        debug!(root = %root.display(), ?current, ?last_id, "opened atomic directory");
        Ok(Self {
            root,
            last_id,
            current,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_id(&self) -> Option<u32> {
        self.current
    }

    fn dir_path(&self, id: u32) -> PathBuf {
        self.root.join(dir_name(id))
    }

    /// List and validate the directory named by `current`
    pub fn init_current(&self) -> Result<Option<Txn>> {
        let Some(id) = self.current else {
            return Ok(None);
        };
        let dir = self.dir_path(id);
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_context(&dir, e))? {
            let entry = entry.map_err(|e| io_context(&dir, e))?;
            let os = entry.file_name();
            let file = os.to_str().ok_or_else(|| {
                HistError::InvalidDirectory(format!("non-UTF-8 name in {}", dir.display()))
            })?;
            let name = FileName::parse(file)
                .or_else(|| LegacyName::parse(file).map(FileName::from))
                .ok_or_else(|| {
                    let msg = format!("unexpected file {file} in {}", dir.display());
                    HistError::InvalidDirectory(msg)
                })?;
            files.push(TxnFile {
                name,
                file: file.to_string(),
            });
        }
        files.sort_by(|a, b| {
            b.name
                .gen
                .low
                .cmp(&a.name.gen.low)
                .then(a.name.level.cmp(&b.name.level))
                .then(a.name.kind.cmp(&b.name.kind))
        });
        validate(&dir, &files)?;
        Ok(Some(Txn { id, dir, files }))
    }

    /// Build the next transaction directory. `ops` declares its files; on
    /// error the partial directory is removed.
    pub fn init_dir<T, F>(&mut self, ops: F) -> Result<(Txn, T)>
    where
        F: FnOnce(&mut DirBuilder<'_>) -> Result<T>,
    {
        let id = self.last_id.map_or(0, |i| i.wrapping_add(1));
        let dir = self.dir_path(id);
        fs::create_dir(&dir).map_err(|e| io_context(&dir, e))?;
        self.last_id = Some(id);

        let mut builder = DirBuilder {
            dir: &dir,
            files: Vec::new(),
        };
        let built = ops(&mut builder).and_then(|out| {
            sync_dir(&dir)?;
            Ok(out)
        });
        let files = builder.files;
        match built {
            Ok(out) => {
                debug!(dir = %dir.display(), files = files.len(), "prepared transaction");
                Ok((Txn { id, dir, files }, out))
            }
            Err(err) => {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %e, "failed to remove partial transaction");
                }
                Err(err)
            }
        }
    }

    /// Make `txn` the live directory and drop the previous one
    pub fn set_current(&mut self, txn: &Txn) -> Result<()> {
        let next = self.root.join(CURRENT_NEXT);
        match fs::remove_file(&next) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_context(&next, e)),
        }
        std::os::unix::fs::symlink(dir_name(txn.id), &next).map_err(|e| io_context(&next, e))?;
        let link = self.root.join(CURRENT);
        fs::rename(&next, &link).map_err(|e| io_context(&link, e))?;
        sync_dir(&self.root)?;

        let previous = self.current.replace(txn.id);
        info!(id = txn.id, ?previous, "switched current directory");
        if let Some(prev) = previous.filter(|p| *p != txn.id) {
            let dir = self.dir_path(prev);
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove previous directory");
            }
        }
        Ok(())
    }

    /// Remove every transaction directory except `current`, and a leftover
    /// `current-next` link. Returns the number of directories removed.
    pub fn collect_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root).map_err(|e| io_context(&self.root, e))? {
            let entry = entry.map_err(|e| io_context(&self.root, e))?;
            let Some(id) = entry.file_name().to_str().and_then(parse_dir_name) else {
                continue;
            };
            if Some(id) == self.current {
                continue;
            }
            let path = entry.path();
            fs::remove_dir_all(&path).map_err(|e| io_context(&path, e))?;
            info!(dir = %path.display(), "removed stale directory");
            removed += 1;
        }
        let next = self.root.join(CURRENT_NEXT);
        if fs::symlink_metadata(&next).is_ok() {
            fs::remove_file(&next).map_err(|e| io_context(&next, e))?;
        }
        Ok(removed)
    }
}

/// Every level-N must be a complete `(keys, values, memindex)` triple and
/// level-0 files must sit at level 0
fn validate(dir: &Path, files: &[TxnFile]) -> Result<()> {
    let mut triples: BTreeMap<(u8, GenRange), Vec<FileKind>> = BTreeMap::new();
    for f in files {
        match f.name.kind {
            FileKind::Level0 if f.name.level != 0 || f.name.gen.width() != 1 => {
                return Err(HistError::InvalidDirectory(format!(
                    "{}: bad level-0 file {}",
                    dir.display(),
                    f.file
                )))
            }
            FileKind::Level0 => {}
            kind => triples.entry((f.name.level, f.name.gen)).or_default().push(kind),
        }
    }
    for ((level, gen), mut kinds) in triples {
        kinds.sort_unstable();
        if kinds != [FileKind::Keys, FileKind::Values, FileKind::MemIndex] {
            return Err(HistError::InvalidDirectory(format!(
                "{}: level {level} generations {gen} has files {kinds:?}",
                dir.display()
            )));
        }
    }
    Ok(())
}
