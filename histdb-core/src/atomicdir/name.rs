//! File names inside a transaction directory

use crate::hex;
use crate::types::GenRange;
use std::fmt;

/// What a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Level0 = 0,
    Keys = 1,
    Values = 2,
    MemIndex = 3,
}

impl FileKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Level0),
            1 => Some(Self::Keys),
            2 => Some(Self::Values),
            3 => Some(Self::MemIndex),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Level0 => "xxxx",
            Self::Keys => "keys",
            Self::Values => "vals",
            Self::MemIndex => "indx",
        }
    }

    fn from_extension(ext: &[u8]) -> Option<Self> {
        match ext {
            b"xxxx" => Some(Self::Level0),
            b"keys" => Some(Self::Keys),
            b"vals" => Some(Self::Values),
            b"indx" => Some(Self::MemIndex),
            _ => None,
        }
    }
}

/// `LxxKxxGxxxxxxxx-xxxxxxxx`: level, kind and generation range in hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileName {
    pub level: u8,
    pub kind: FileKind,
    pub gen: GenRange,
}

pub const FILE_NAME_LEN: usize = 24;

impl FileName {
    /// The level-0 buffer of generation `gen`
    pub fn level0(gen: u32) -> Self {
        Self {
            level: 0,
            kind: FileKind::Level0,
            gen: GenRange::single(gen),
        }
    }

    /// One file of the level-N covering `range`
    pub fn level_n(range: GenRange, kind: FileKind) -> Self {
        Self {
            level: (range.depth() + 1).min(u8::MAX as u32) as u8,
            kind,
            gen: range,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != FILE_NAME_LEN || b[0] != b'L' || b[3] != b'K' || b[6] != b'G' || b[15] != b'-'
        {
            return None;
        }
        let level = hex::get8(&b[1..3])?;
        let kind = FileKind::from_u8(hex::get8(&b[4..6])?)?;
        let low = hex::get32(&b[7..15])?;
        let high = hex::get32(&b[16..24])?;
        if low >= high {
            return None;
        }
        Some(Self {
            level,
            kind,
            gen: GenRange::new(low, high),
        })
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; FILE_NAME_LEN];
        out[0] = b'L';
        out[1..3].copy_from_slice(&hex::put8(self.level));
        out[3] = b'K';
        out[4..6].copy_from_slice(&hex::put8(self.kind as u8));
        out[6] = b'G';
        out[7..15].copy_from_slice(&hex::put32(self.gen.low));
        out[15] = b'-';
        out[16..24].copy_from_slice(&hex::put32(self.gen.high));
        // all bytes are ASCII
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

/// The older `llllllll-hhhhhhhh.kind` scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LegacyName {
    pub gen: GenRange,
    pub kind: FileKind,
}

impl LegacyName {
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != 22 || b[8] != b'-' || b[17] != b'.' {
            return None;
        }
        let low = hex::get32(&b[..8])?;
        let high = hex::get32(&b[9..17])?;
        let kind = FileKind::from_extension(&b[18..])?;
        if low >= high {
            return None;
        }
        Some(Self {
            gen: GenRange::new(low, high),
            kind,
        })
    }
}

impl fmt::Display for LegacyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:08x}.{}",
            self.gen.low,
            self.gen.high,
            self.kind.extension()
        )
    }
}

impl From<LegacyName> for FileName {
    fn from(l: LegacyName) -> Self {
        match l.kind {
            FileKind::Level0 => FileName::level0(l.gen.low),
            kind => FileName::level_n(l.gen, kind),
        }
    }
}
