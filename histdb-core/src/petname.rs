//! Interning tables: a hash maps to a dense id, the id to bytes in one
//! growing buffer.

use crate::arena::SingleArena;
use crate::hashtable::HashTable;
use crate::types::HashKey;
use crate::varint::{self, Reader};
use crate::{HistError, Result};

/// Byte range inside the backing buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Span {
    begin: u32,
    end: u32,
}

/// Shared core of both table shapes
#[derive(Debug, Clone)]
struct Interner<K> {
    ids: HashTable<K, u32>,
    keys: Vec<K>,
    spans: SingleArena<Span>,
    buf: Vec<u8>,
}

impl<K: HashKey> Interner<K> {
    fn new() -> Self {
        Self {
            ids: HashTable::new(),
            keys: Vec::new(),
            spans: SingleArena::new(),
            buf: Vec::new(),
        }
    }

    fn put_with(&mut self, h: K, fill: impl FnOnce(&mut Vec<u8>)) -> (u32, bool) {
        if let Some(id) = self.ids.get(&h) {
            return (id, false);
        }
        let begin = self.buf.len() as u32;
        fill(&mut self.buf);
        let end = self.buf.len() as u32;
        let id = self.spans.push(Span { begin, end });
        self.keys.push(h);
        self.ids.insert(h, id);
        (id, true)
    }

    fn bytes(&self, id: u32) -> Option<&[u8]> {
        let span = self.spans.get(id)?;
        self.buf.get(span.begin as usize..span.end as usize)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn append_to(&self, out: &mut Vec<u8>) {
        varint::append(out, self.keys.len() as u64);
        for (id, key) in self.keys.iter().enumerate() {
            out.extend_from_slice(key.as_bytes());
            varint::append_len_prefixed(out, self.bytes(id as u32).unwrap_or_default());
        }
    }

    fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        let mut table = Self::new();
        let count = reader.varint()? as usize;
        for _ in 0..count {
            let key = K::from_slice(reader.bytes(K::SIZE)?)
                .ok_or_else(|| HistError::InvalidFormat("bad name table key".into()))?;
            let bytes = reader.len_prefixed()?;
            let (_, fresh) = table.put_with(key, |buf| buf.extend_from_slice(bytes));
            if !fresh {
                return Err(HistError::Corruption("duplicate name table key".into()));
            }
        }
        Ok(table)
    }
}

/// Hash → interned byte string
#[derive(Debug, Clone)]
pub struct NameTable<K> {
    inner: Interner<K>,
}

impl<K: HashKey> Default for NameTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HashKey> NameTable<K> {
    pub fn new() -> Self {
        Self {
            inner: Interner::new(),
        }
    }

    /// Intern `value` under `h`. The first value stored for a hash wins;
    /// returns the id and whether it was freshly assigned.
    pub fn put(&mut self, h: K, value: &[u8]) -> (u32, bool) {
        self.inner.put_with(h, |buf| buf.extend_from_slice(value))
    }

    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.inner.bytes(id)
    }

    pub fn id(&self, h: &K) -> Option<u32> {
        self.inner.ids.get(h)
    }

    pub fn hash(&self, id: u32) -> Option<K> {
        self.inner.keys.get(id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_to(&self, out: &mut Vec<u8>) {
        self.inner.append_to(out);
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            inner: Interner::read_from(reader)?,
        })
    }
}

/// Hash → interned list of `u32`, stored as varints
#[derive(Debug, Clone)]
pub struct ListTable<K> {
    inner: Interner<K>,
}

impl<K: HashKey> Default for ListTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HashKey> ListTable<K> {
    pub fn new() -> Self {
        Self {
            inner: Interner::new(),
        }
    }

    pub fn put(&mut self, h: K, values: &[u32]) -> (u32, bool) {
        self.inner.put_with(h, |buf| {
            for v in values {
                varint::append(buf, *v as u64);
            }
        })
    }

    /// Decoded list for `id`
    pub fn get(&self, id: u32) -> Option<ListIter<'_>> {
        self.inner.bytes(id).map(|bytes| ListIter { bytes })
    }

    pub fn id(&self, h: &K) -> Option<u32> {
        self.inner.ids.get(h)
    }

    pub fn hash(&self, id: u32) -> Option<K> {
        self.inner.keys.get(id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_to(&self, out: &mut Vec<u8>) {
        self.inner.append_to(out);
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            inner: Interner::read_from(reader)?,
        })
    }
}

/// Iterator over one interned list
#[derive(Debug, Clone)]
pub struct ListIter<'a> {
    bytes: &'a [u8],
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let (v, n) = varint::consume(self.bytes)?;
        self.bytes = &self.bytes[n..];
        Some(v as u32)
    }
}
