//! HistDB Core - embedded time-series database for metric distributions
//!
//! Every metric is a set of `key=value` tags; every observation lands in a
//! sparse float32 histogram keyed by the metric, a timestamp and a duration.
//!
//! # Architecture
//!
//! - **Histogram**: three-level flat bucket tree over the ordered bits of a
//!   float, with lock-free observation
//! - **Tags**: interned tags, roaring postings and a query stack machine
//! - **Level-0**: fixed-size append-only buffer taking live observations
//! - **Level-N**: immutable B+tree key file plus span-packed value file
//! - **Compaction**: k-way merge of adjacent level-Ns
//! - **Atomic directory**: every change is a new directory published by
//!   swapping a symlink

pub mod arena;
pub mod atomicdir;
pub mod bitmap;
pub mod compaction;
pub mod hashtable;
pub mod hex;
pub mod histogram;
pub mod level0;
pub mod leveln;
pub mod merge;
pub mod petname;
pub mod storage;
pub mod tags;
pub mod varint;

mod error;
mod types;

pub use error::{HistError, Result};
pub use histogram::{HistogramStore, Summary};
pub use storage::{MetricSummary, Store, StoreConfig, StoreStats};
pub use tags::{Expr, FixerConfig, TagIndex};
pub use types::*;

/// HistDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Bits of the ordered float consumed by each histogram level
    pub const HIST_L0_BITS: u32 = 5;
    pub const HIST_L1_BITS: u32 = 5;
    pub const HIST_L2_BITS: u32 = 6;

    /// Counter value past which a histogram leaf is promoted to 64 bits
    pub const HIST_GROW_THRESHOLD: u32 = 1 << 28;

    /// Level-0 entry area (2MB)
    pub const L0_DATA_SIZE: usize = 2 * 1024 * 1024;

    /// Level-0 sorted index area (128KB)
    pub const L0_INDEX_SIZE: usize = 128 * 1024;

    pub const L0_ENTRY_ALIGN: usize = 32;

    /// Key file page size (16KB)
    pub const KEY_PAGE_SIZE: usize = 16 * 1024;
    pub const KEY_PAGE_HEADER_SIZE: usize = 30;
    pub const KEY_ENTRY_SIZE: usize = 37;

    /// Maximum value span (2KB)
    pub const VALUE_SPAN_SIZE: usize = 2048;

    /// Spans start on this boundary; span offsets count these units
    pub const VALUE_SPAN_ALIGN: usize = 256;
    pub const VALUE_ENTRY_HEADER_SIZE: usize = 10;
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
