//! Fusing adjacent level-Ns into one covering their combined generations

use crate::arena::Handle;
use crate::histogram::HistogramStore;
use crate::leveln::{LevelN, LevelPaths, LevelWriter, MAX_VALUE_LEN};
use crate::merge::{KeyIterator, MergeIter};
use crate::tags::TagIndex;
use crate::types::{GenRange, Key, MetricHash};
use crate::{HistError, Result};
use tracing::{debug, info};

/// Folded histograms held before the scratch store is replaced
const FOLD_STORE_LIMIT: usize = 4096;

/// Outcome of one merge into a level-N
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Entries written
    pub entries: u64,
    pub metrics: u64,
    /// Keys that arrived more than once and were folded into one histogram
    pub folded: u64,
    /// Keys whose histogram was split across several entries
    pub split: u64,
}

/// Values seen for the current key. A lone value is copied through; a
/// second one starts a folded histogram.
struct KeyRun {
    key: Option<Key>,
    first: Vec<u8>,
    folded: Option<Handle>,
    store: HistogramStore,
}

impl KeyRun {
    fn new() -> Self {
        Self {
            key: None,
            first: Vec::new(),
            folded: None,
            store: HistogramStore::new(),
        }
    }

    fn push(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        if self.key.is_none() {
            self.key = Some(*key);
            self.first.clear();
            self.first.extend_from_slice(value);
            return Ok(());
        }
        let h = match self.folded {
            Some(h) => h,
            None => {
                let h = self.store.deserialize(&self.first)?;
                self.folded = Some(h);
                h
            }
        };
        self.store.merge_bytes(h, value)
    }

    /// Write the run as one entry, or as several when its histogram does
    /// not fit a span
    fn flush(&mut self, writer: &mut LevelWriter, stats: &mut MergeStats) -> Result<()> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        let h = match self.folded.take() {
            Some(h) => {
                stats.folded += 1;
                h
            }
            None if self.first.len() <= MAX_VALUE_LEN => {
                writer.add(&key, &self.first)?;
                stats.entries += 1;
                return Ok(());
            }
            None => self.store.deserialize(&self.first)?,
        };
        let pieces = self
            .store
            .append_chunks(h, MAX_VALUE_LEN, |piece| writer.add(&key, piece))?;
        stats.entries += pieces as u64;
        if pieces > 1 {
            stats.split += 1;
            debug!(?key, pieces, "split histogram across entries");
        }
        if self.store.len() >= FOLD_STORE_LIMIT {
            self.store = HistogramStore::new();
        }
        Ok(())
    }
}

/// Stream the merge of `inputs` into `writer`. Entries sharing a key are
/// folded into one histogram, and a histogram too large for a span is
/// written as several entries under the same key. `on_metric` runs once per
/// distinct hash with the index of the input that produced it first.
pub(crate) fn merge_into<I: KeyIterator>(
    inputs: Vec<I>,
    writer: &mut LevelWriter,
    mut on_metric: impl FnMut(usize, &MetricHash) -> Result<()>,
) -> Result<MergeStats> {
    let mut merge = MergeIter::new(inputs)?;
    let mut stats = MergeStats::default();
    let mut run = KeyRun::new();
    let mut prev: Option<MetricHash> = None;
    while merge.next()? {
        let key = *merge.key();
        if run.key != Some(key) {
            run.flush(writer, &mut stats)?;
            let hash = key.hash();
            if prev != Some(hash) {
                let input = merge.current_input().unwrap_or_default();
                on_metric(input, &hash)?;
                stats.metrics += 1;
                prev = Some(hash);
            }
        }
        run.push(&key, merge.value())?;
    }
    run.flush(writer, &mut stats)?;
    Ok(stats)
}

/// Range covered by a run of level-Ns, which must be adjacent and oldest
/// first
pub fn fused_range(inputs: &[&LevelN]) -> Result<GenRange> {
    let (Some(first), Some(last)) = (inputs.first(), inputs.last()) else {
        return Err(HistError::InvalidFormat("nothing to compact".into()));
    };
    for pair in inputs.windows(2) {
        if !pair[0].range().adjoins(&pair[1].range()) {
            return Err(HistError::InvalidFormat(format!(
                "level-ns {} and {} are not adjacent",
                pair[0].range(),
                pair[1].range()
            )));
        }
    }
    Ok(GenRange::new(first.range().low, last.range().high))
}

/// Merge `inputs` into a new level-N written at `paths`. Metric names are
/// re-interned into a fresh tag index in merge order, so identifiers in the
/// output are dense again.
pub fn compact(inputs: &[&LevelN], paths: LevelPaths) -> Result<MergeStats> {
    let range = fused_range(inputs)?;
    info!(range = %range, inputs = inputs.len(), "compacting level-ns");

    let iters = inputs
        .iter()
        .map(|lv| lv.iter())
        .collect::<Result<Vec<_>>>()?;
    let mut writer = LevelWriter::create(paths, range)?;
    let mut index = TagIndex::new();
    let mut name = Vec::new();
    let stats = merge_into(iters, &mut writer, |input, hash| {
        let source = inputs[input].index();
        name.clear();
        let found = source
            .id_by_hash(hash)
            .is_some_and(|id| source.append_name(id, &mut name));
        if !found {
            return Err(HistError::Corruption(format!(
                "level-n {} has data for a metric missing from its index",
                inputs[input].range()
            )));
        }
        index.add(&name);
        Ok(())
    })?;
    writer.finish(&index)?;

    info!(
        range = %range,
        entries = stats.entries,
        metrics = index.cardinality(),
        "compaction finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::append_observation;
    use crate::merge::VecIter;
    use crate::tags::metric_hash;
    use std::path::Path;
    use tempfile::TempDir;

    fn observation(v: f32) -> Vec<u8> {
        let mut out = Vec::new();
        append_observation(v, &mut out);
        out
    }

    fn level(dir: &Path, range: GenRange, metrics: &[&str], ts: u32) -> LevelN {
        let paths = LevelPaths::in_dir(dir, range);
        let mut index = TagIndex::new();
        let mut items: Vec<(Key, Vec<u8>)> = metrics
            .iter()
            .map(|m| {
                index.add(m.as_bytes());
                (Key::new(&metric_hash(m.as_bytes()), ts, 0), observation(ts as f32))
            })
            .collect();
        items.sort();
        let mut w = LevelWriter::create(paths.clone(), range).unwrap();
        for (k, v) in &items {
            w.add(k, v).unwrap();
        }
        w.finish(&index).unwrap();
        LevelN::open(paths, range).unwrap()
    }

    #[test]
    fn test_compact_merges_keys_and_names() {
        let tmp = TempDir::new().unwrap();
        let a = level(tmp.path(), GenRange::single(0), &["a=1", "b=2"], 10);
        let b = level(tmp.path(), GenRange::single(1), &["b=2", "c=3"], 20);
        let out_range = GenRange::new(0, 2);
        let paths = LevelPaths::in_dir(tmp.path(), out_range);
        let stats = compact(&[&a, &b], paths.clone()).unwrap();
        assert_eq!(stats.entries, 4);
        assert_eq!(stats.metrics, 3);

        let out = LevelN::open(paths, out_range).unwrap();
        assert_eq!(out.depth(), 1);
        assert_eq!(out.index().cardinality(), 3);
        for m in ["a=1", "b=2", "c=3"] {
            let id = out.index().id_by_hash(&metric_hash(m.as_bytes())).unwrap();
            assert_eq!(out.index().name(id).unwrap(), m.as_bytes());
        }

        let mut it = out.iter().unwrap();
        let mut keys = Vec::new();
        while it.next().unwrap() {
            keys.push(*it.key());
        }
        let mut expect: Vec<Key> = [("a=1", 10), ("b=2", 10), ("b=2", 20), ("c=3", 20)]
            .iter()
            .map(|(m, ts)| Key::new(&metric_hash(m.as_bytes()), *ts, 0))
            .collect();
        expect.sort();
        assert_eq!(keys, expect);
    }

    #[test]
    fn test_equal_keys_fold_and_keep_older_first() {
        let tmp = TempDir::new().unwrap();
        let a = level(tmp.path(), GenRange::single(0), &["x=1"], 5);
        let b = level(tmp.path(), GenRange::single(1), &["x=1"], 5);
        let paths = LevelPaths::in_dir(tmp.path(), GenRange::new(0, 2));
        let mut writer = LevelWriter::create(paths, GenRange::new(0, 2)).unwrap();
        let mut firsts = Vec::new();
        merge_into(
            vec![a.iter().unwrap(), b.iter().unwrap()],
            &mut writer,
            |input, _| {
                firsts.push(input);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(firsts, vec![0]);
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_wide_histogram_is_split_not_dropped() {
        let tmp = TempDir::new().unwrap();
        let hash = metric_hash(b"lat=api");
        let key = Key::new(&hash, 0, 0);
        let deltas: Vec<(Key, Vec<u8>)> = (0..3000)
            .map(|i| {
                let v = 2f32.powi(i % 200 - 100) * (1.0 + (i % 61) as f32 / 61.0);
                (key, observation(v))
            })
            .collect();
        let other = Key::new(&metric_hash(b"lat=db"), 0, 0);
        let tail = vec![(other, observation(1.0))];

        let range = GenRange::single(0);
        let paths = LevelPaths::in_dir(tmp.path(), range);
        let mut writer = LevelWriter::create(paths.clone(), range).unwrap();
        let inputs = vec![VecIter::new(deltas), VecIter::new(tail)];
        let stats = merge_into(inputs, &mut writer, |_, _| Ok(())).unwrap();
        let mut index = TagIndex::new();
        index.add(b"lat=api");
        index.add(b"lat=db");
        writer.finish(&index).unwrap();

        assert_eq!(stats.metrics, 2);
        assert_eq!(stats.folded, 1);
        assert_eq!(stats.split, 1);
        assert!(stats.entries > 2);

        let out = LevelN::open(paths, range).unwrap();
        let store = HistogramStore::new();
        let h = store.new_histogram();
        let mut it = out.seek(&key).unwrap();
        let mut pieces = 0;
        while it.next().unwrap() && *it.key() == key {
            assert!(it.value().len() <= MAX_VALUE_LEN);
            store.merge_bytes(h, it.value()).unwrap();
            pieces += 1;
        }
        assert_eq!(pieces as u64, stats.entries - 1);
        assert_eq!(store.total(h), 3000);
    }

    #[test]
    fn test_rejects_gaps() {
        let tmp = TempDir::new().unwrap();
        let a = level(tmp.path(), GenRange::single(0), &["a=1"], 0);
        let c = level(tmp.path(), GenRange::single(2), &["a=1"], 0);
        assert!(fused_range(&[&a, &c]).is_err());
        assert!(fused_range(&[]).is_err());
        assert_eq!(fused_range(&[&a]).unwrap(), GenRange::single(0));
    }
}
