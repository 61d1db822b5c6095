//! Tag rewriting applied before a metric is canonicalized

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Substring replacement inside the values of one tag key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub key: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    /// Tag keys whose terms are dropped entirely
    pub drop: Vec<String>,
    pub replace: Vec<Replacement>,
}

#[derive(Debug, Clone, Default)]
pub struct Fixer {
    drop: Vec<Vec<u8>>,
    replace: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>,
}

impl Fixer {
    pub fn new(config: &FixerConfig) -> Self {
        Self {
            drop: config.drop.iter().map(|k| k.as_bytes().to_vec()).collect(),
            replace: config
                .replace
                .iter()
                .filter(|r| !r.from.is_empty())
                .map(|r| {
                    (
                        r.key.as_bytes().to_vec(),
                        r.from.as_bytes().to_vec(),
                        r.to.as_bytes().to_vec(),
                    )
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.replace.is_empty()
    }

    /// Rewritten tag, or `None` when the term is dropped
    pub fn fix<'a>(&self, tkey: &[u8], tag: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        if self.drop.iter().any(|k| k == tkey) {
            return None;
        }
        let mut tag = Cow::Borrowed(tag);
        for (key, from, to) in &self.replace {
            if key != tkey {
                continue;
            }
            let value = super::tag_value(tkey, &tag);
            if let Some(rewritten) = replace_all(value, from, to) {
                let mut out = Vec::with_capacity(tkey.len() + 1 + rewritten.len());
                out.extend_from_slice(tkey);
                if !rewritten.is_empty() {
                    out.push(b'=');
                    out.extend_from_slice(&rewritten);
                }
                tag = Cow::Owned(out);
            }
        }
        Some(tag)
    }
}

/// `None` when `from` does not occur
fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut last = 0;
    let mut i = 0;
    while i + from.len() <= haystack.len() {
        if &haystack[i..i + from.len()] == from {
            out.extend_from_slice(&haystack[last..i]);
            out.extend_from_slice(to);
            i += from.len();
            last = i;
        } else {
            i += 1;
        }
    }
    if last == 0 && out.is_empty() {
        return None;
    }
    out.extend_from_slice(&haystack[last..]);
    Some(out)
}
