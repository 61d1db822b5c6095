//! Metric tag parsing, hashing and the inverted tag index
//!
//! A metric is a `,`-separated list of `key=value` or bare `key` terms with
//! `\` escaping the next byte. The metric hash sums the hashes of its
//! distinct tag keys and distinct tags, so term order and repetition do not
//! change it.

mod fixer;
mod glob;
mod index;
mod query;

pub use fixer::{Fixer, FixerConfig, Replacement};
pub use glob::Glob;
pub use index::{Added, TagIndex};
pub use query::{Expr, Program};

use crate::types::{MetricHash, TagHash, TagKeyHash};

/// Split the first term off `input`.
///
/// Returns `(tag_key, tag, rest)`. Escapes are kept in the returned slices.
/// A term with an empty value (`key=`) yields the bare key as its tag.
pub fn pop_tag(input: &[u8]) -> (&[u8], &[u8], &[u8]) {
    let mut key_end = None;
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'=' if key_end.is_none() => key_end = Some(i),
            b',' => break,
            _ => {}
        }
        i += 1;
    }
    let end = i.min(input.len());
    let tag = &input[..end];
    let rest: &[u8] = if end < input.len() { &input[end + 1..] } else { &[] };
    match key_end {
        Some(k) if k + 1 == end => (&tag[..k], &tag[..k], rest),
        Some(k) => (&tag[..k], tag, rest),
        None => (tag, tag, rest),
    }
}

/// Iterator over the non-empty `(tag_key, tag)` terms of a metric
#[derive(Debug, Clone)]
pub struct Terms<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Terms<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.rest.is_empty() {
            let (tkey, tag, rest) = pop_tag(self.rest);
            self.rest = rest;
            if !tag.is_empty() {
                return Some((tkey, tag));
            }
        }
        None
    }
}

pub fn terms(metric: &[u8]) -> Terms<'_> {
    Terms { rest: metric }
}

/// Value part of a tag given its key, empty for bare keys
pub fn tag_value<'a>(tkey: &[u8], tag: &'a [u8]) -> &'a [u8] {
    tag.get(tkey.len() + 1..).unwrap_or_default()
}

/// Accumulates a metric hash over distinct terms
#[derive(Debug, Default, Clone)]
pub struct HashBuilder {
    hash: MetricHash,
    seen_keys: Vec<TagKeyHash>,
    seen_tags: Vec<TagHash>,
}

impl HashBuilder {
    /// Add one term; returns false when the tag was already counted
    pub fn add(&mut self, tkey: &[u8], tag: &[u8]) -> bool {
        self.add_hashes(TagKeyHash::of(tkey), TagHash::of(tag))
    }

    pub fn add_hashes(&mut self, kh: TagKeyHash, th: TagHash) -> bool {
        if self.seen_tags.contains(&th) {
            return false;
        }
        self.seen_tags.push(th);
        self.hash.add_tag(th);

        if !self.seen_keys.contains(&kh) {
            self.seen_keys.push(kh);
            self.hash.add_tag_key(kh);
        }
        true
    }

    pub fn finish(&self) -> MetricHash {
        self.hash
    }
}

/// Canonical hash of a metric string
pub fn metric_hash(metric: &[u8]) -> MetricHash {
    let mut b = HashBuilder::default();
    for (tkey, tag) in terms(metric) {
        b.add(tkey, tag);
    }
    b.finish()
}
