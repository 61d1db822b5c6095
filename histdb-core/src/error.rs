//! Error types for HistDB

use std::path::Path;
use thiserror::Error;

/// Result type alias for HistDB operations
pub type Result<T> = std::result::Result<T, HistError>;

/// HistDB error types
#[derive(Error, Debug)]
pub enum HistError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A decoder ran out of input
    #[error("Short buffer: needed {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },

    /// Key file page is misaligned or malformed
    #[error("Invalid page: {0}")]
    InvalidPage(String),

    /// Value file span is misaligned or malformed
    #[error("Invalid span: {0}")]
    InvalidSpan(String),

    /// Value does not fit in a single value span
    #[error("Value too large: {len} bytes exceeds span capacity of {max}")]
    ValueTooLarge { len: usize, max: usize },

    /// Key reader found indices out of range
    #[error("Corrupt key reader: {0}")]
    CorruptKeyReader(String),

    /// The atomic directory is in a state we refuse to open
    #[error("Invalid directory state: {0}")]
    InvalidDirectory(String),

    /// Level-0 buffer entered its permanent error state
    #[error("Level-0 buffer failed: {0}")]
    Level0Failed(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Query error
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HistError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, HistError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HistError::Corruption(_)
                | HistError::InvalidPage(_)
                | HistError::InvalidSpan(_)
                | HistError::CorruptKeyReader(_)
                | HistError::ShortBuffer { .. }
        )
    }

    pub(crate) fn short(needed: usize, available: usize) -> Self {
        HistError::ShortBuffer { needed, available }
    }
}

/// Attach the offending path to an IO error.
pub(crate) fn io_context(path: &Path, err: std::io::Error) -> HistError {
    HistError::Io(std::io::Error::new(
        err.kind(),
        format!("{}: {}", path.display(), err),
    ))
}
