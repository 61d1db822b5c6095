//! Inverted index from tags and tag keys to metric ids

use super::{tag_value, terms, Fixer, HashBuilder};
use crate::petname::{ListTable, NameTable};
use crate::types::{MetricHash, TagHash, TagKeyHash};
use crate::varint::{self, Reader};
use crate::{HistError, Result};
use roaring::RoaringBitmap;
use std::borrow::Cow;
use std::sync::Arc;

const VERSION: u64 = 0;

/// Outcome of [`TagIndex::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    pub hash: MetricHash,
    pub id: u32,
    /// Canonical metric name: the distinct tags in first-seen order
    pub name: Vec<u8>,
    pub fresh: bool,
}

/// Posting lists, each indexed by tag id or tag-key id
#[derive(Debug, Clone, Default)]
struct Postings {
    tag_to_metrics: Vec<RoaringBitmap>,
    tag_to_tkeys: Vec<RoaringBitmap>,
    tag_to_tags: Vec<RoaringBitmap>,
    tkey_to_metrics: Vec<RoaringBitmap>,
    tkey_to_tkeys: Vec<RoaringBitmap>,
    tkey_to_tags: Vec<RoaringBitmap>,
    tkey_to_tvals: Vec<RoaringBitmap>,
}

impl Postings {
    fn arrays(&self) -> [&Vec<RoaringBitmap>; 7] {
        [
            &self.tag_to_metrics,
            &self.tag_to_tkeys,
            &self.tag_to_tags,
            &self.tkey_to_metrics,
            &self.tkey_to_tkeys,
            &self.tkey_to_tags,
            &self.tkey_to_tvals,
        ]
    }

    fn arrays_mut(&mut self) -> [&mut Vec<RoaringBitmap>; 7] {
        [
            &mut self.tag_to_metrics,
            &mut self.tag_to_tkeys,
            &mut self.tag_to_tags,
            &mut self.tkey_to_metrics,
            &mut self.tkey_to_tkeys,
            &mut self.tkey_to_tags,
            &mut self.tkey_to_tvals,
        ]
    }
}

fn slot(v: &mut Vec<RoaringBitmap>, id: u32) -> &mut RoaringBitmap {
    let i = id as usize;
    if v.len() <= i {
        v.resize_with(i + 1, RoaringBitmap::new);
    }
    &mut v[i]
}

#[derive(Debug, Clone, Default)]
pub struct TagIndex {
    metrics: ListTable<MetricHash>,
    tkeys: NameTable<TagKeyHash>,
    tags: NameTable<TagHash>,
    postings: Postings,
    fixer: Option<Arc<Fixer>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index that rewrites tags with `fixer` before interning them
    pub fn with_fixer(fixer: Arc<Fixer>) -> Self {
        Self {
            fixer: Some(fixer),
            ..Self::default()
        }
    }

    /// Number of distinct metrics
    pub fn cardinality(&self) -> usize {
        self.metrics.len()
    }

    /// Intern a metric and index it when first seen
    pub fn add(&mut self, metric: &[u8]) -> Added {
        let mut builder = HashBuilder::default();
        let mut tag_ids = Vec::new();
        let mut tag_keys = Vec::new();
        let mut key_ids = Vec::new();

        for (tkey, raw) in terms(metric) {
            let tag = match &self.fixer {
                Some(f) => match f.fix(tkey, raw) {
                    Some(t) => t,
                    None => continue,
                },
                None => Cow::Borrowed(raw),
            };
            let kh = TagKeyHash::of(tkey);
            let th = TagHash::of(&tag);
            if !builder.add_hashes(kh, th) {
                continue;
            }
            let (tid, _) = self.tags.put(th, &tag);
            let (kid, _) = self.tkeys.put(kh, tkey);
            tag_ids.push(tid);
            tag_keys.push(kid);
            if !key_ids.contains(&kid) {
                key_ids.push(kid);
            }
        }

        let hash = builder.finish();
        let (id, fresh) = self.metrics.put(hash, &tag_ids);
        if fresh {
            self.index_postings(id, &tag_ids, &tag_keys, &key_ids);
        }
        let mut name = Vec::with_capacity(metric.len());
        self.append_name(id, &mut name);
        Added {
            hash,
            id,
            name,
            fresh,
        }
    }

    /// `tag_keys[i]` is the key id of `tag_ids[i]`
    fn index_postings(&mut self, m: u32, tag_ids: &[u32], tag_keys: &[u32], key_ids: &[u32]) {
        let p = &mut self.postings;
        for &t in tag_ids {
            slot(&mut p.tag_to_metrics, t).insert(m);
            slot(&mut p.tag_to_tkeys, t).extend(key_ids.iter().copied());
            slot(&mut p.tag_to_tags, t).extend(tag_ids.iter().copied());
        }
        for &k in key_ids {
            slot(&mut p.tkey_to_metrics, k).insert(m);
            slot(&mut p.tkey_to_tkeys, k).extend(key_ids.iter().copied());
            slot(&mut p.tkey_to_tags, k).extend(tag_ids.iter().copied());
        }
        for (&t, &k) in tag_ids.iter().zip(tag_keys) {
            slot(&mut p.tkey_to_tvals, k).insert(t);
        }
    }

    pub fn id_by_hash(&self, hash: &MetricHash) -> Option<u32> {
        self.metrics.id(hash)
    }

    pub fn hash_by_id(&self, id: u32) -> Option<MetricHash> {
        self.metrics.hash(id)
    }

    /// Append the canonical name of metric `id`; false when unknown
    pub fn append_name(&self, id: u32, out: &mut Vec<u8>) -> bool {
        let Some(tag_ids) = self.metrics.get(id) else {
            return false;
        };
        for (i, t) in tag_ids.enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(self.tags.get(t).unwrap_or_default());
        }
        true
    }

    pub fn name(&self, id: u32) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        self.append_name(id, &mut out).then_some(out)
    }

    /// Every metric id in this index
    pub fn all_metrics(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        all.insert_range(0..self.cardinality() as u32);
        all
    }

    fn tkey_id(&self, key: &[u8]) -> Option<u32> {
        self.tkeys.id(&TagKeyHash::of(key))
    }

    fn tag_id(&self, tag: &[u8]) -> Option<u32> {
        self.tags.id(&TagHash::of(tag))
    }

    fn bitmap(v: &[RoaringBitmap], id: u32) -> Option<&RoaringBitmap> {
        v.get(id as usize)
    }

    /// OR the metrics carrying `tag` into `acc`
    pub fn query_equal(&self, tag: &[u8], acc: &mut RoaringBitmap) {
        if let Some(b) = self
            .tag_id(tag)
            .and_then(|t| Self::bitmap(&self.postings.tag_to_metrics, t))
        {
            *acc |= b;
        }
    }

    /// OR the metrics carrying key `key` with any tag other than `tag`
    pub fn query_not_equal(&self, key: &[u8], tag: &[u8], acc: &mut RoaringBitmap) {
        let excluded = self.tag_id(tag);
        self.for_each_value(key, |tid, _| {
            if Some(tid) != excluded {
                if let Some(b) = Self::bitmap(&self.postings.tag_to_metrics, tid) {
                    *acc |= b;
                }
            }
        });
    }

    /// OR the metrics whose value for `key` satisfies `pred`
    pub fn query_filter(&self, key: &[u8], pred: impl Fn(&[u8]) -> bool, acc: &mut RoaringBitmap) {
        self.for_each_value(key, |tid, value| {
            if pred(value) {
                if let Some(b) = Self::bitmap(&self.postings.tag_to_metrics, tid) {
                    *acc |= b;
                }
            }
        });
    }

    /// OR the metrics whose value for `key` fails `pred`
    pub fn query_filter_not(
        &self,
        key: &[u8],
        pred: impl Fn(&[u8]) -> bool,
        acc: &mut RoaringBitmap,
    ) {
        self.query_filter(key, |v| !pred(v), acc);
    }

    /// OR the metrics carrying every key in `keys` into `acc`. No keys
    /// selects everything.
    pub fn query_true<K: AsRef<[u8]>>(&self, keys: &[K], acc: &mut RoaringBitmap) {
        let mut found: Option<RoaringBitmap> = None;
        for key in keys {
            let Some(b) = self
                .tkey_id(key.as_ref())
                .and_then(|k| Self::bitmap(&self.postings.tkey_to_metrics, k))
            else {
                return;
            };
            found = Some(match found {
                Some(f) => f & b,
                None => b.clone(),
            });
        }
        match found {
            Some(f) => *acc |= f,
            None => *acc |= self.all_metrics(),
        }
    }

    fn for_each_value(&self, key: &[u8], mut f: impl FnMut(u32, &[u8])) {
        let Some(vals) = self
            .tkey_id(key)
            .and_then(|k| Self::bitmap(&self.postings.tkey_to_tvals, k))
        else {
            return;
        };
        for tid in vals {
            if let Some(tag) = self.tags.get(tid) {
                f(tid, tag_value(key, tag));
            }
        }
    }

    fn names<'a>(&'a self, ids: Option<&'a RoaringBitmap>, keys: bool) -> Vec<&'a [u8]> {
        ids.into_iter()
            .flat_map(|b| b.iter())
            .filter_map(|id| {
                if keys {
                    self.tkeys.get(id)
                } else {
                    self.tags.get(id)
                }
            })
            .collect()
    }

    /// Distinct tags seen under `key`
    pub fn values_of(&self, key: &[u8]) -> Vec<&[u8]> {
        let ids = self
            .tkey_id(key)
            .and_then(|k| Self::bitmap(&self.postings.tkey_to_tvals, k));
        self.names(ids, false)
    }

    /// Tag keys co-occurring with `key` (including itself)
    pub fn keys_with_key(&self, key: &[u8]) -> Vec<&[u8]> {
        let ids = self
            .tkey_id(key)
            .and_then(|k| Self::bitmap(&self.postings.tkey_to_tkeys, k));
        self.names(ids, true)
    }

    /// Tags co-occurring with any tag under `key`
    pub fn tags_with_key(&self, key: &[u8]) -> Vec<&[u8]> {
        let ids = self
            .tkey_id(key)
            .and_then(|k| Self::bitmap(&self.postings.tkey_to_tags, k));
        self.names(ids, false)
    }

    /// Tag keys co-occurring with `tag`
    pub fn keys_with_tag(&self, tag: &[u8]) -> Vec<&[u8]> {
        let ids = self
            .tag_id(tag)
            .and_then(|t| Self::bitmap(&self.postings.tag_to_tkeys, t));
        self.names(ids, true)
    }

    /// Tags co-occurring with `tag` (including itself)
    pub fn tags_with_tag(&self, tag: &[u8]) -> Vec<&[u8]> {
        let ids = self
            .tag_id(tag)
            .and_then(|t| Self::bitmap(&self.postings.tag_to_tags, t));
        self.names(ids, false)
    }

    /// Iterate `(id, hash)` of every metric in id order
    pub fn metrics(&self) -> impl Iterator<Item = (u32, MetricHash)> + '_ {
        (0..self.cardinality() as u32).filter_map(|id| Some((id, self.metrics.hash(id)?)))
    }

    pub fn append_to(&self, out: &mut Vec<u8>) -> Result<()> {
        varint::append(out, VERSION);
        varint::append(out, self.cardinality() as u64);
        self.metrics.append_to(out);
        self.tkeys.append_to(out);
        self.tags.append_to(out);

        let mut scratch = Vec::new();
        for array in self.postings.arrays() {
            varint::append(out, array.len() as u64);
            for bitmap in array {
                scratch.clear();
                bitmap.serialize_into(&mut scratch)?;
                varint::append_len_prefixed(out, &scratch);
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.append_to(&mut out)?;
        Ok(out)
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        let version = reader.varint()?;
        if version != VERSION {
            return Err(HistError::InvalidFormat(format!(
                "unsupported tag index version {version}"
            )));
        }
        let cardinality = reader.varint()? as usize;
        let metrics = ListTable::read_from(reader)?;
        if metrics.len() != cardinality {
            return Err(HistError::Corruption(format!(
                "tag index cardinality {cardinality} but {} metrics",
                metrics.len()
            )));
        }
        let tkeys = NameTable::read_from(reader)?;
        let tags = NameTable::read_from(reader)?;

        let mut postings = Postings::default();
        for (i, array) in postings.arrays_mut().into_iter().enumerate() {
            let limit = if i < 3 { tags.len() } else { tkeys.len() };
            let n = reader.varint()? as usize;
            if n > limit {
                return Err(HistError::Corruption(format!(
                    "posting array {i} has {n} entries for {limit} ids"
                )));
            }
            array.reserve(n);
            for _ in 0..n {
                let bytes = reader.len_prefixed()?;
                let bitmap = RoaringBitmap::deserialize_from(bytes)
                    .map_err(|e| HistError::InvalidFormat(format!("posting list: {e}")))?;
                array.push(bitmap);
            }
        }

        Ok(Self {
            metrics,
            tkeys,
            tags,
            postings,
            fixer: None,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        Self::read_from(&mut reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::FixerConfig;

    fn sample() -> TagIndex {
        let mut idx = TagIndex::new();
        idx.add(b"host=a,dc=east,env=prod");
        idx.add(b"host=b,dc=east");
        idx.add(b"host=c,dc=west,env=dev");
        idx.add(b"dc=west,cache");
        idx
    }

    fn ids(b: &RoaringBitmap) -> Vec<u32> {
        b.iter().collect()
    }

    #[test]
    fn test_add_assigns_dense_ids() {
        let mut idx = TagIndex::new();
        let a = idx.add(b"b=2,a=1");
        assert!(a.fresh);
        assert_eq!(a.id, 0);
        assert_eq!(a.name, b"b=2,a=1");

        let again = idx.add(b"a=1,b=2,a=1");
        assert!(!again.fresh);
        assert_eq!(again.id, 0);
        assert_eq!(again.hash, a.hash);
        assert_eq!(again.name, b"b=2,a=1");

        assert_eq!(idx.add(b"a=1").id, 1);
        assert_eq!(idx.cardinality(), 2);
        assert_eq!(idx.id_by_hash(&a.hash), Some(0));
        assert_eq!(idx.hash_by_id(0), Some(a.hash));
    }

    #[test]
    fn test_query_equal_and_true() {
        let idx = sample();
        let mut acc = RoaringBitmap::new();
        idx.query_equal(b"dc=east", &mut acc);
        assert_eq!(ids(&acc), vec![0, 1]);

        let mut acc = RoaringBitmap::new();
        idx.query_true(&[b"env".as_slice(), b"dc".as_slice()], &mut acc);
        assert_eq!(ids(&acc), vec![0, 2]);

        let mut acc = RoaringBitmap::new();
        idx.query_true(&[b"cache".as_slice()], &mut acc);
        assert_eq!(ids(&acc), vec![3]);

        let mut acc = RoaringBitmap::new();
        idx.query_true(&[b"missing".as_slice()], &mut acc);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_not_equal_and_filters() {
        let idx = sample();
        let mut acc = RoaringBitmap::new();
        idx.query_not_equal(b"dc", b"dc=east", &mut acc);
        assert_eq!(ids(&acc), vec![2, 3]);

        let mut acc = RoaringBitmap::new();
        idx.query_filter(b"host", |v| v > b"a".as_slice(), &mut acc);
        assert_eq!(ids(&acc), vec![1, 2]);

        let mut acc = RoaringBitmap::new();
        idx.query_filter_not(b"host", |v| v == b"a", &mut acc);
        assert_eq!(ids(&acc), vec![1, 2]);
    }

    #[test]
    fn test_relationship_lists() {
        let idx = sample();
        let mut values = idx.values_of(b"dc");
        values.sort();
        assert_eq!(values, vec![&b"dc=east"[..], &b"dc=west"[..]]);

        let mut keys = idx.keys_with_tag(b"dc=west");
        keys.sort();
        assert_eq!(keys, vec![&b"cache"[..], &b"dc"[..], &b"env"[..], &b"host"[..]]);

        assert!(idx.keys_with_key(b"cache").contains(&&b"dc"[..]));
        assert!(idx.tags_with_tag(b"env=dev").contains(&&b"host=c"[..]));
        assert!(idx.tags_with_key(b"env").contains(&&b"dc=east"[..]));
    }

    #[test]
    fn test_fixer_applies_before_hashing() {
        let raw = r#"{"drop":["pid"],"replace":[{"key":"host","from":"-old","to":""}]}"#;
        let config: FixerConfig = serde_json::from_str(raw).unwrap();
        let mut idx = TagIndex::with_fixer(Arc::new(Fixer::new(&config)));
        let a = idx.add(b"host=web-old,pid=7");
        let b = idx.add(b"host=web");
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.name, b"host=web");
        assert_eq!(idx.cardinality(), 1);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let idx = sample();
        let bytes = idx.to_bytes().unwrap();
        let back = TagIndex::from_bytes(&bytes).unwrap();

        assert_eq!(back.cardinality(), idx.cardinality());
        for tag in [&b"dc=east"[..], b"dc=west", b"host=a", b"cache", b"env=dev"] {
            let (mut x, mut y) = (RoaringBitmap::new(), RoaringBitmap::new());
            idx.query_equal(tag, &mut x);
            back.query_equal(tag, &mut y);
            assert_eq!(x, y);
        }
        for (id, hash) in idx.metrics() {
            assert_eq!(back.id_by_hash(&hash), Some(id));
            assert_eq!(back.name(id), idx.name(id));
        }
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = 0x02; // varint 1
        assert!(matches!(
            TagIndex::from_bytes(&bytes),
            Err(HistError::InvalidFormat(_))
        ));
    }
}
