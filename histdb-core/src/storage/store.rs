//! The store: observation routing, level flushes, compaction and queries
//!
//! Locks are taken in the order `state`, `live`, `index`. `observe` holds
//! `index` alone to intern the metric, then a read guard on `live` for the
//! level-0 append. Rotation commits the new directory under `state` and
//! only takes `live` for writing to swap in the fresh level-0.

use super::StoreConfig;
use crate::arena::Handle;
use crate::atomicdir::{AtomicDir, FileKind, FileName, Txn};
use crate::compaction::{self, merge_into};
use crate::config::L0_DATA_SIZE;
use crate::histogram::{append_observation, HistogramStore};
use crate::level0::{self, Appended, Level0Reader, Level0Writer};
use crate::leveln::{LevelN, LevelPaths, LevelWriter};
use crate::merge::KeyIterator;
use crate::tags::{Expr, Fixer, Program, TagIndex};
use crate::types::{Duration, GenRange, Key, MetricHash, Timestamp};
use crate::{HistError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-metric row returned by [`Store::summaries`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub total: u64,
    pub sum: f64,
    pub mean: f64,
    pub variance: f64,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub p50: Option<f32>,
    pub p90: Option<f32>,
    pub p99: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelStats {
    pub low: u32,
    pub high: u32,
    pub depth: u32,
    pub metrics: usize,
}

/// Store statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Id of the current transaction directory
    pub directory: u32,
    /// Generation of the live level-0
    pub generation: u32,
    pub frozen_level0s: usize,
    /// Distinct keys in the live level-0
    pub live_keys: usize,
    /// Metrics known to the level-0 tag index
    pub metrics: usize,
    pub levels: Vec<LevelStats>,
}

/// The level-0 taking observations. The file gets one delta entry per
/// observation; `hists` keeps the running sum per key for queries.
struct Live {
    gen: u32,
    writer: Mutex<Level0Writer>,
    hists: HistogramStore,
    handles: Mutex<BTreeMap<Key, Handle>>,
}

impl Live {
    fn fresh(gen: u32, writer: Level0Writer, grow_threshold: u32) -> Self {
        Self {
            gen,
            writer: Mutex::new(writer),
            hists: HistogramStore::with_grow_threshold(grow_threshold),
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    fn handle(&self, key: &Key) -> Handle {
        *self
            .handles
            .lock()
            .entry(*key)
            .or_insert_with(|| self.hists.new_histogram())
    }
}

/// Directory state changed only by rotation, level writes and compaction
struct State {
    dir: AtomicDir,
    txn: Txn,
    /// Finished level-0s of the current directory, oldest first
    frozen: Vec<Level0Reader>,
    levels: Vec<LevelN>,
}

fn new_index(fixer: &Option<Arc<Fixer>>) -> TagIndex {
    match fixer {
        Some(f) => TagIndex::with_fixer(Arc::clone(f)),
        None => TagIndex::new(),
    }
}

fn level0_path(txn: &Txn, gen: u32) -> PathBuf {
    txn.dir().join(FileName::level0(gen).to_string())
}

/// Commit a directory holding every file of `prev` plus an empty level-0
/// for `gen`
fn rotate_dir(dir: &mut AtomicDir, prev: &Txn, gen: u32) -> Result<(Txn, Level0Writer)> {
    let (txn, writer) = dir.init_dir(|b| {
        for f in prev.files() {
            b.include(prev, f)?;
        }
        let path = b.allocate(FileName::level0(gen), level0::FILE_SIZE)?;
        Level0Writer::create(path)
    })?;
    dir.set_current(&txn)?;
    Ok((txn, writer))
}

/// Merge every entry of `hash` with timestamp `<= at` from a sorted stream
/// positioned at the hash's first key
fn merge_stream<I: KeyIterator>(
    mut it: I,
    hash: &MetricHash,
    at: Timestamp,
    out: &HistogramStore,
    h: Handle,
) -> Result<bool> {
    let mut seen = false;
    while it.next()? {
        let key = it.key();
        if key.hash_bytes() != &hash.0[..] {
            break;
        }
        if key.timestamp() <= at {
            out.merge_bytes(h, it.value())?;
            seen = true;
        }
    }
    Ok(seen)
}

/// Merge everything stored for `hash` up to `at` into `h`
fn gather(
    state: &State,
    live: &Live,
    hash: &MetricHash,
    at: Timestamp,
    out: &HistogramStore,
    h: Handle,
) -> Result<bool> {
    let lo = Key::new(hash, 0, 0);
    let mut seen = false;
    for (key, src) in live.handles.lock().range(lo..) {
        if key.hash_bytes() != &hash.0[..] {
            break;
        }
        if key.timestamp() <= at {
            out.merge(h, &live.hists, *src);
            seen = true;
        }
    }
    for reader in &state.frozen {
        seen |= merge_stream(reader.seek(&lo), hash, at, out, h)?;
    }
    for lv in &state.levels {
        seen |= merge_stream(lv.seek(&lo)?, hash, at, out, h)?;
    }
    Ok(seen)
}

impl State {
    fn rebase_levels(&mut self) {
        for lv in &mut self.levels {
            lv.rebase(self.txn.dir());
        }
    }

    /// Freeze the finished level-0 of `live` and commit a directory with an
    /// empty one for the next generation
    fn rotate(&mut self, live: &Live) -> Result<(u32, Level0Writer)> {
        live.writer.lock().finish()?;
        let old = live.gen;
        let next = old + 1;
        let (txn, writer) = rotate_dir(&mut self.dir, &self.txn, next)?;
        let reader = Level0Reader::open(level0_path(&txn, old))?;
        self.frozen.push(reader);
        self.txn = txn;
        self.rebase_levels();
        Ok((next, writer))
    }

    fn write_level(&mut self, live: &mut Live, memindex: &TagIndex) -> Result<GenRange> {
        live.writer.get_mut().finish()?;
        let live_reader = Level0Reader::open(level0_path(&self.txn, live.gen))?;
        let next = live.gen + 1;
        let low = self.txn.level0s().first().copied().unwrap_or(live.gen);
        let range = GenRange::new(low, next);

        let State {
            dir, txn, frozen, ..
        } = self;
        let txn = &*txn;
        let readers: Vec<&Level0Reader> = frozen
            .iter()
            .chain(std::iter::once(&live_reader))
            .collect();
        let (new_txn, (stats, writer)) = dir.init_dir(|b| {
            for f in txn.files() {
                if f.name.kind != FileKind::Level0 {
                    b.include(txn, f)?;
                }
            }
            for kind in [FileKind::Keys, FileKind::Values, FileKind::MemIndex] {
                b.create(FileName::level_n(range, kind));
            }
            let mut out = LevelWriter::create(LevelPaths::in_dir(b.dir(), range), range)?;
            let iters = readers.iter().map(|r| r.iter()).collect::<Vec<_>>();
            let stats = merge_into(iters, &mut out, |_, _| Ok(()))?;
            out.finish(memindex)?;
            let path = b.allocate(FileName::level0(next), level0::FILE_SIZE)?;
            Ok((stats, Level0Writer::create(path)?))
        })?;
        dir.set_current(&new_txn)?;

        self.levels.push(LevelN::open(
            LevelPaths::in_dir(new_txn.dir(), range),
            range,
        )?);
        self.txn = new_txn;
        self.rebase_levels();
        self.frozen.clear();
        *live = Live::fresh(next, writer, live.hists.grow_threshold());
        info!(
            range = %range,
            entries = stats.entries,
            metrics = stats.metrics,
            folded = stats.folded,
            split = stats.split,
            "wrote level-n"
        );
        Ok(range)
    }

    /// Fuse the last two level-Ns if they have the same depth
    fn compact_last_pair(&mut self) -> Result<bool> {
        let n = self.levels.len();
        if n < 2 {
            return Ok(false);
        }
        let (ra, rb) = (self.levels[n - 2].range(), self.levels[n - 1].range());
        if ra.depth() != rb.depth() || !ra.adjoins(&rb) {
            return Ok(false);
        }
        let range = GenRange::new(ra.low, rb.high);

        let State {
            dir, txn, levels, ..
        } = self;
        let inputs = [&levels[n - 2], &levels[n - 1]];
        let (new_txn, stats) = dir.init_dir(|b| {
            for f in txn.files() {
                let level_input = f.name.gen == ra || f.name.gen == rb;
                if f.name.kind == FileKind::Level0 || !level_input {
                    b.include(txn, f)?;
                }
            }
            for kind in [FileKind::Keys, FileKind::Values, FileKind::MemIndex] {
                b.create(FileName::level_n(range, kind));
            }
            compaction::compact(&inputs, LevelPaths::in_dir(b.dir(), range))
        })?;
        // the previous directory, and with it the inputs, is gone after this
        dir.set_current(&new_txn)?;

        levels.truncate(n - 2);
        levels.push(LevelN::open(
            LevelPaths::in_dir(new_txn.dir(), range),
            range,
        )?);
        *txn = new_txn;
        self.rebase_levels();
        debug!(
            range = %range,
            entries = stats.entries,
            split = stats.split,
            "fused level-ns"
        );
        Ok(true)
    }
}

/// Recovered view of one level-0 file
struct Replayed {
    hists: HistogramStore,
    handles: BTreeMap<Key, Handle>,
}

/// Add every metric of `reader` to `memindex`, and when `fold` is set sum
/// its deltas per key
fn replay(
    reader: &Level0Reader,
    memindex: &mut TagIndex,
    fold: bool,
    grow_threshold: u32,
) -> Result<Replayed> {
    let hists = HistogramStore::with_grow_threshold(grow_threshold);
    let mut handles = BTreeMap::new();
    for entry in reader.entries() {
        let e = entry?;
        memindex.add(e.name);
        if fold {
            let h = *handles.entry(e.key).or_insert_with(|| hists.new_histogram());
            hists.merge_bytes(h, e.value)?;
        }
    }
    Ok(Replayed { hists, handles })
}

/// Embedded histogram store. `observe`, the queries and `sync` may be
/// called from many threads; the `&mut self` operations need it quiet.
pub struct Store {
    config: StoreConfig,
    fixer: Option<Arc<Fixer>>,
    state: RwLock<State>,
    live: RwLock<Live>,
    /// Tag index shared by every level-0 of the current directory
    index: Mutex<TagIndex>,
}

impl Store {
    /// Open the store under `config.data_dir`, creating it if empty and
    /// recovering the live level-0 otherwise
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let fixer = config.fixer.as_ref().map(|c| Arc::new(Fixer::new(c)));
        let mut dir = AtomicDir::init(&config.data_dir)?;
        if config.collect_stale_dirs {
            let removed = dir.collect_stale()?;
            if removed > 0 {
                info!(removed, "collected stale directories");
            }
        }

        let mut txn = match dir.init_current()? {
            Some(txn) => txn,
            None => {
                let (txn, ()) = dir.init_dir(|b| {
                    b.allocate(FileName::level0(0), level0::FILE_SIZE)?;
                    Ok(())
                })?;
                dir.set_current(&txn)?;
                info!(root = %dir.root().display(), "initialised new store");
                txn
            }
        };
        if txn.has_legacy_names() {
            let prev = txn;
            let (next, ()) = dir.init_dir(|b| {
                for f in prev.files() {
                    b.include(&prev, f)?;
                }
                Ok(())
            })?;
            dir.set_current(&next)?;
            info!(files = next.files().len(), "renamed legacy files");
            txn = next;
        }

        let mut levels = Vec::new();
        for range in txn.levels() {
            levels.push(LevelN::open(LevelPaths::in_dir(txn.dir(), range), range)?);
        }

        let grow_threshold = config.grow_threshold;
        let mut memindex = new_index(&fixer);
        let mut frozen = Vec::new();
        let mut live = None;
        let gens = txn.level0s();
        for (i, &gen) in gens.iter().enumerate() {
            let last = i + 1 == gens.len();
            let path = level0_path(&txn, gen);
            if level0::is_blank(&path)? {
                if last {
                    let writer = Level0Writer::create(&path)?;
                    live = Some(Live::fresh(gen, writer, grow_threshold));
                }
                continue;
            }
            let reader = Level0Reader::open(&path)?;
            let resume = last && !reader.is_finished();
            let replayed = replay(&reader, &mut memindex, resume, grow_threshold)?;
            if resume {
                let writer = Level0Writer::resume(&path)?;
                info!(
                    generation = gen,
                    entries = reader.len(),
                    keys = replayed.handles.len(),
                    "recovered live level-0"
                );
                live = Some(Live {
                    gen,
                    writer: Mutex::new(writer),
                    hists: replayed.hists,
                    handles: Mutex::new(replayed.handles),
                });
            } else {
                frozen.push(reader);
            }
        }

        let live = match live {
            Some(live) => live,
            None => {
                let next = gens
                    .last()
                    .map(|g| g + 1)
                    .into_iter()
                    .chain(levels.last().map(|l| l.range().high))
                    .max()
                    .unwrap_or(0);
                let (next_txn, writer) = rotate_dir(&mut dir, &txn, next)?;
                txn = next_txn;
                for lv in &mut levels {
                    lv.rebase(txn.dir());
                }
                Live::fresh(next, writer, grow_threshold)
            }
        };

        info!(
            root = %dir.root().display(),
            generation = live.gen,
            frozen = frozen.len(),
            levels = levels.len(),
            metrics = memindex.cardinality(),
            "opened store"
        );
        let state = State {
            dir,
            txn,
            frozen,
            levels,
        };
        Ok(Self {
            config,
            fixer,
            state: RwLock::new(state),
            live: RwLock::new(live),
            index: Mutex::new(memindex),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Record one observation of `metric`. Non-finite values are ignored.
    pub fn observe(
        &self,
        metric: &[u8],
        value: f32,
        timestamp: Timestamp,
        duration: Duration,
    ) -> Result<()> {
        if !value.is_finite() {
            return Ok(());
        }
        let added = self.index.lock().add(metric);
        let key = Key::new(&added.hash, timestamp, duration);
        let mut delta = Vec::with_capacity(32);
        append_observation(value, &mut delta);
        let len = level0::entry_len(added.name.len(), delta.len());
        if len > L0_DATA_SIZE - level0::FILE_HEADER_SIZE {
            return Err(HistError::Level0Failed(format!(
                "entry for {} does not fit an empty level-0",
                String::from_utf8_lossy(&added.name)
            )));
        }

        loop {
            let gen = {
                let live = self.live.read();
                let appended = live.writer.lock().append(&key, &added.name, &delta)?;
                match appended {
                    Appended::Stored => {
                        live.hists.observe(live.handle(&key), value);
                        return Ok(());
                    }
                    Appended::Full => live.gen,
                }
            };
            self.rotate(gen)?;
        }
    }

    /// Replace the live level-0 of generation `gen` unless another caller
    /// already did
    fn rotate(&self, gen: u32) -> Result<()> {
        let mut state = self.state.write();
        let (next, writer) = {
            let live = self.live.read();
            if live.gen != gen {
                return Ok(());
            }
            state.rotate(&live)?
        };
        *self.live.write() = Live::fresh(next, writer, self.config.grow_threshold);
        info!(generation = next, frozen = state.frozen.len(), "rotated level-0");
        Ok(())
    }

    /// Convert every level-0 of the current directory into one level-N and
    /// start a fresh level-0. Returns the generations the new level covers.
    pub fn write_level(&mut self) -> Result<GenRange> {
        let index = self.index.get_mut();
        let range = self
            .state
            .get_mut()
            .write_level(self.live.get_mut(), index)?;
        *index = new_index(&self.fixer);
        if self.config.compact_on_write_level {
            self.compact_suffix()?;
        }
        Ok(range)
    }

    /// Repeatedly fuse the last two level-Ns while their depths match.
    /// Returns the number of fusions.
    pub fn compact_suffix(&mut self) -> Result<usize> {
        let state = self.state.get_mut();
        let mut fused = 0;
        while state.compact_last_pair()? {
            fused += 1;
        }
        if fused > 0 {
            info!(fused, levels = state.levels.len(), "compacted suffix");
        }
        Ok(fused)
    }

    /// Evaluate `expr` against every tag index and, for each matching metric
    /// with data at or before `at`, call `cb` with its merged histogram.
    /// Returns the number of callbacks.
    pub fn query_data<F>(&self, expr: &Expr, at: Timestamp, mut cb: F) -> Result<usize>
    where
        F: FnMut(&MetricHash, &[u8], &HistogramStore, Handle),
    {
        let program = Program::compile(expr)?;
        let state = self.state.read();
        let live = self.live.write();
        live.hists.finalize();

        let mut metrics: BTreeMap<MetricHash, Vec<u8>> = BTreeMap::new();
        {
            let memindex = self.index.lock();
            let levels = state.levels.iter().map(LevelN::index);
            for index in std::iter::once(&*memindex).chain(levels) {
                for id in program.eval(index)? {
                    if let Some(hash) = index.hash_by_id(id) {
                        metrics
                            .entry(hash)
                            .or_insert_with(|| index.name(id).unwrap_or_default());
                    }
                }
            }
        }

        let out = HistogramStore::with_grow_threshold(self.config.grow_threshold);
        let mut found = 0;
        for (hash, name) in &metrics {
            let h = out.new_histogram();
            if gather(&state, &live, hash, at, &out, h)? {
                cb(hash, name, &out, h);
                found += 1;
            }
        }
        debug!(candidates = metrics.len(), found, "query");
        Ok(found)
    }

    /// Summaries of every metric matching `expr` up to `at`
    pub fn summaries(&self, expr: &Expr, at: Timestamp) -> Result<Vec<MetricSummary>> {
        let mut rows = Vec::new();
        self.query_data(expr, at, |_, name, store, h| {
            let s = store.summary(h);
            rows.push(MetricSummary {
                name: String::from_utf8_lossy(name).into_owned(),
                total: s.total,
                sum: s.sum,
                mean: s.mean,
                variance: s.variance,
                min: store.min(h),
                max: store.max(h),
                p50: store.quantile(h, 0.5),
                p90: store.quantile(h, 0.9),
                p99: store.quantile(h, 0.99),
            });
        })?;
        Ok(rows)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        let live = self.live.read();
        let live_keys = live.handles.lock().len();
        StoreStats {
            directory: state.txn.id(),
            generation: live.gen,
            frozen_level0s: state.frozen.len(),
            live_keys,
            metrics: self.index.lock().cardinality(),
            levels: state
                .levels
                .iter()
                .map(|lv| LevelStats {
                    low: lv.range().low,
                    high: lv.range().high,
                    depth: lv.depth(),
                    metrics: lv.index().cardinality(),
                })
                .collect(),
        }
    }

    /// Flush the live level-0 to disk. A level-0 that filled up and awaits
    /// rotation is already durable.
    pub fn sync(&self) -> Result<()> {
        let live = self.live.read();
        let mut writer = live.writer.lock();
        if writer.is_finished() {
            return Ok(());
        }
        writer.sync()
    }

    /// Flush and release everything. The live level-0 stays unfinished and
    /// is resumed by the next `open`.
    pub fn close(self) -> Result<()> {
        let live = self.live.into_inner();
        live.writer.into_inner().close()?;
        let State { levels, .. } = self.state.into_inner();
        for lv in levels {
            lv.close()?;
        }
        info!("closed store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::FixerConfig;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path) -> StoreConfig {
        crate::init_test_tracing();
        StoreConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn totals(store: &Store, expr: &Expr) -> Vec<(String, u64)> {
        store
            .summaries(expr, Timestamp::MAX)
            .unwrap()
            .into_iter()
            .map(|s| (s.name, s.total))
            .collect()
    }

    fn grand_total(store: &Store, expr: &Expr) -> u64 {
        totals(store, expr).iter().map(|(_, t)| t).sum()
    }

    fn ingest_basic(store: &Store) {
        for _ in 0..1000 {
            store.observe(b"foo=bar", 1.0, 0, 0).unwrap();
        }
        for _ in 0..500 {
            store.observe(b"foo=baz", 2.0, 0, 0).unwrap();
        }
    }

    fn check_basic(store: &Store) {
        let rows = store.summaries(&Expr::metric(b"foo=bar"), Timestamp::MAX).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "foo=bar");
        assert_eq!(rows[0].total, 1000);
        assert_eq!(rows[0].min, rows[0].max);
        let one = rows[0].min.unwrap();
        assert!((one - 1.0).abs() < 0.01, "{one}");

        let rows = totals(store, &Expr::metric(b"foo"));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|(_, t)| t).sum::<u64>(), 1500);
    }

    #[test]
    fn test_basic_ingest_and_query() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(config(tmp.path())).unwrap();
        ingest_basic(&store);
        check_basic(&store);
        assert_eq!(store.stats().metrics, 2);
    }

    #[test]
    fn test_query_after_write_level_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::open(config(tmp.path())).unwrap();
        ingest_basic(&store);
        let range = store.write_level().unwrap();
        assert_eq!(range, GenRange::single(0));
        check_basic(&store);
        let stats = store.stats();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.live_keys, 0);
        assert_eq!(stats.levels.len(), 1);
        store.close().unwrap();

        let store = Store::open(config(tmp.path())).unwrap();
        check_basic(&store);
    }

    #[test]
    fn test_recovers_unfinished_level0() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(config(tmp.path())).unwrap();
        ingest_basic(&store);
        store.sync().unwrap();
        // no close: the level-0 is left unfinished
        drop(store);

        let store = Store::open(config(tmp.path())).unwrap();
        check_basic(&store);
        store.observe(b"foo=bar", 1.0, 0, 0).unwrap();
        assert_eq!(grand_total(&store, &Expr::metric(b"foo=bar")), 1001);
    }

    #[test]
    fn test_compaction_preserves_counts() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::open(config(tmp.path())).unwrap();
        for round in 0..10u32 {
            for m in 0..1000 {
                let metric = format!("m={m}");
                store.observe(metric.as_bytes(), round as f32, round, 0).unwrap();
            }
            store.write_level().unwrap();
        }
        assert_eq!(store.stats().levels.len(), 10);
        assert_eq!(store.compact_suffix().unwrap(), 1);

        let stats = store.stats();
        assert_eq!(stats.levels.len(), 9);
        let last = stats.levels.last().unwrap();
        assert_eq!((last.low, last.high, last.depth), (8, 10, 1));
        assert_eq!(last.metrics, 1000);

        let rows = totals(&store, &Expr::tags(&["m"]));
        assert_eq!(rows.len(), 1000);
        assert_eq!(rows.iter().map(|(_, t)| t).sum::<u64>(), 10_000);
    }

    #[test]
    fn test_compact_on_write_level_builds_power_of_two_levels() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::open(StoreConfig {
            compact_on_write_level: true,
            ..config(tmp.path())
        })
        .unwrap();
        for round in 0..5u32 {
            store.observe(b"a=1", 1.0, round, 0).unwrap();
            store.write_level().unwrap();
        }
        let ranges: Vec<(u32, u32)> = store
            .stats()
            .levels
            .iter()
            .map(|l| (l.low, l.high))
            .collect();
        assert_eq!(ranges, vec![(0, 4), (4, 5)]);
        assert_eq!(grand_total(&store, &Expr::metric(b"a=1")), 5);
        store.close().unwrap();

        let store = Store::open(config(tmp.path())).unwrap();
        assert_eq!(store.stats().levels.len(), 2);
        assert_eq!(grand_total(&store, &Expr::metric(b"a=1")), 5);
    }

    #[test]
    fn test_full_level0_rotates() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(config(tmp.path())).unwrap();
        let n = 30_000u32;
        for i in 0..n {
            let metric = format!("k={}", i % 100);
            store.observe(metric.as_bytes(), i as f32, i, 0).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.frozen_level0s, 1);
        assert_eq!(stats.generation, 1);
        assert_eq!(grand_total(&store, &Expr::tags(&["k"])), n as u64);
        store.close().unwrap();

        let store = Store::open(config(tmp.path())).unwrap();
        assert_eq!(store.stats().frozen_level0s, 1);
        assert_eq!(grand_total(&store, &Expr::tags(&["k"])), n as u64);
    }

    /// Spreads over about 200 binary exponents and 61 mantissa steps, far
    /// more buckets than one value span holds
    fn wide_value(i: u32) -> f32 {
        2f32.powi((i % 200) as i32 - 100) * (1.0 + (i % 61) as f32 / 61.0)
    }

    #[test]
    fn test_wide_histogram_survives_level_writes() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::open(config(tmp.path())).unwrap();
        let metric = Expr::metric(b"lat=api");
        for i in 0..3000 {
            store.observe(b"lat=api", wide_value(i), 0, 0).unwrap();
        }
        let before = store.summaries(&metric, Timestamp::MAX).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].total, 3000);

        store.write_level().unwrap();
        let after = store.summaries(&metric, Timestamp::MAX).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].total, 3000);
        assert_eq!(after[0].min, before[0].min);
        assert_eq!(after[0].max, before[0].max);
        assert_eq!(after[0].p50, before[0].p50);

        for i in 0..3000 {
            store.observe(b"lat=api", wide_value(i + 7), 1, 0).unwrap();
        }
        store.write_level().unwrap();
        assert_eq!(store.compact_suffix().unwrap(), 1);
        assert_eq!(grand_total(&store, &metric), 6000);
        let at_zero = store.summaries(&metric, 0).unwrap();
        assert_eq!(at_zero[0].total, 3000);
        assert_eq!(at_zero[0].min, before[0].min);
        assert_eq!(at_zero[0].max, before[0].max);
        store.close().unwrap();

        let store = Store::open(config(tmp.path())).unwrap();
        assert_eq!(grand_total(&store, &metric), 6000);
    }

    #[test]
    fn test_rotations_then_suffix_compaction() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::open(config(tmp.path())).unwrap();
        // 2048-byte entries: 1023 fit one level-0
        let pad = "x".repeat(1960);
        assert_eq!(level0::entry_len(11 + pad.len(), 17), 2048);
        let mut ranges = Vec::new();
        for half in 0..2u32 {
            for round in 0..5u32 {
                let ts = half * 5 + round;
                for m in 0..1000 {
                    let metric = format!("m={m:04},pad={pad}");
                    store.observe(metric.as_bytes(), ts as f32, ts, 0).unwrap();
                }
            }
            assert_eq!(store.stats().frozen_level0s, 4);
            ranges.push(store.write_level().unwrap());
        }
        assert_eq!(ranges, vec![GenRange::new(0, 5), GenRange::new(5, 10)]);
        assert_eq!(store.compact_suffix().unwrap(), 1);

        let stats = store.stats();
        assert_eq!(stats.levels.len(), 1);
        let level = &stats.levels[0];
        assert_eq!((level.low, level.high), (0, 10));
        assert_eq!(level.metrics, 1000);

        let rows = totals(&store, &Expr::tags(&["m"]));
        assert_eq!(rows.len(), 1000);
        assert!(rows.iter().all(|(_, t)| *t == 10));
        assert_eq!(rows.iter().map(|(_, t)| t).sum::<u64>(), 10_000);
    }

    #[test]
    fn test_concurrent_observers_across_rotations() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(config(tmp.path())).unwrap());
        let pad = "y".repeat(1960);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                let pad = pad.clone();
                std::thread::spawn(move || {
                    for i in 0..600u32 {
                        let metric = format!("t={t},pad={pad}");
                        store.observe(metric.as_bytes(), i as f32, i, 0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.frozen_level0s, 2);
        assert_eq!(stats.generation, 2);
        assert_eq!(grand_total(&store, &Expr::tags(&["t"])), 2400);
    }

    #[test]
    fn test_entry_larger_than_level0_is_refused() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(config(tmp.path())).unwrap();
        let huge = format!("a={}", "z".repeat(L0_DATA_SIZE));
        assert!(matches!(
            store.observe(huge.as_bytes(), 1.0, 0, 0),
            Err(HistError::Level0Failed(_))
        ));
        store.observe(b"b=1", 1.0, 0, 0).unwrap();
        assert_eq!(store.stats().generation, 0);
        assert_eq!(grand_total(&store, &Expr::metric(b"b=1")), 1);
    }

    #[test]
    fn test_at_bounds_timestamps() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::open(config(tmp.path())).unwrap();
        store.observe(b"a=1", 1.0, 10, 0).unwrap();
        store.write_level().unwrap();
        store.observe(b"a=1", 1.0, 20, 0).unwrap();
        store.observe(b"a=1", 1.0, 30, 0).unwrap();

        let at = |t| {
            store
                .summaries(&Expr::metric(b"a=1"), t)
                .unwrap()
                .first()
                .map_or(0, |s| s.total)
        };
        assert_eq!(at(5), 0);
        assert_eq!(at(10), 1);
        assert_eq!(at(25), 2);
        assert_eq!(at(Timestamp::MAX), 3);
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(config(tmp.path())).unwrap();
        store.observe(b"a=1", f32::NAN, 0, 0).unwrap();
        store.observe(b"a=1", f32::INFINITY, 0, 0).unwrap();
        assert!(totals(&store, &Expr::metric(b"a=1")).is_empty());
        store.observe(b"a=1", 3.0, 0, 0).unwrap();
        assert_eq!(grand_total(&store, &Expr::metric(b"a=1")), 1);
    }

    #[test]
    fn test_fixer_rewrites_metrics() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(StoreConfig {
            fixer: Some(FixerConfig {
                drop: vec!["host".into()],
                replace: Vec::new(),
            }),
            ..config(tmp.path())
        })
        .unwrap();
        store.observe(b"svc=api,host=a", 1.0, 0, 0).unwrap();
        store.observe(b"host=b,svc=api", 1.0, 0, 0).unwrap();
        assert_eq!(
            totals(&store, &Expr::metric(b"svc=api")),
            vec![("svc=api".to_string(), 2)]
        );
    }

    #[test]
    fn test_concurrent_observers() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(config(tmp.path())).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let metric = format!("t={t}");
                        store.observe(metric.as_bytes(), i as f32, 0, 0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(grand_total(&store, &Expr::tags(&["t"])), 2000);
    }

    #[test]
    fn test_stale_directories_are_collected() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(config(tmp.path())).unwrap();
        let current = store.stats().directory;
        store.close().unwrap();
        std::fs::create_dir(tmp.path().join("000000ff")).unwrap();

        let store = Store::open(config(tmp.path())).unwrap();
        assert_eq!(store.stats().directory, current);
        assert!(!tmp.path().join("000000ff").exists());
    }
}
