//! Sorted key streams and their tournament merge

use crate::types::Key;
use crate::Result;

/// A cursor over keys in ascending order. `next` must be called once before
/// the first `key`.
pub trait KeyIterator {
    /// Advance; `Ok(false)` at the end of the stream
    fn next(&mut self) -> Result<bool>;
    fn key(&self) -> &Key;
    fn value(&self) -> &[u8];
}

impl<T: KeyIterator + ?Sized> KeyIterator for Box<T> {
    fn next(&mut self) -> Result<bool> {
        (**self).next()
    }

    fn key(&self) -> &Key {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }
}

const NONE: usize = usize::MAX;

/// Winner tree over `N` inputs stored as a binary heap array. Equal keys come
/// out in input order, so callers list older inputs first.
pub struct MergeIter<I> {
    inputs: Vec<I>,
    live: Vec<bool>,
    /// `tree[1]` is the overall winner; `tree[leaves + i]` is input `i`
    tree: Vec<usize>,
    leaves: usize,
    started: bool,
    failed: bool,
    empty: Key,
}

impl<I: KeyIterator> MergeIter<I> {
    /// Advance every input once and play the initial tournament
    pub fn new(mut inputs: Vec<I>) -> Result<Self> {
        let leaves = inputs.len().next_power_of_two().max(1);
        let mut live = Vec::with_capacity(inputs.len());
        for input in inputs.iter_mut() {
            live.push(input.next()?);
        }
        let mut tree = vec![NONE; 2 * leaves];
        for i in 0..inputs.len() {
            tree[leaves + i] = i;
        }
        let mut merge = Self {
            inputs,
            live,
            tree,
            leaves,
            started: false,
            failed: false,
            empty: Key::default(),
        };
        for node in (1..leaves).rev() {
            merge.tree[node] = merge.winner(merge.tree[2 * node], merge.tree[2 * node + 1]);
        }
        Ok(merge)
    }

    fn is_live(&self, i: usize) -> bool {
        i != NONE && self.live[i]
    }

    /// Smaller key wins; ties go to the lower input index
    fn winner(&self, a: usize, b: usize) -> usize {
        match (self.is_live(a), self.is_live(b)) {
            (false, false) => a.min(b),
            (true, false) => a,
            (false, true) => b,
            (true, true) => {
                let (ka, kb) = (self.inputs[a].key(), self.inputs[b].key());
                if kb < ka || (kb == ka && b < a) {
                    b
                } else {
                    a
                }
            }
        }
    }

    fn replay(&mut self, input: usize) {
        let mut node = (self.leaves + input) / 2;
        while node >= 1 {
            self.tree[node] = self.winner(self.tree[2 * node], self.tree[2 * node + 1]);
            node /= 2;
        }
    }

    /// Index of the input that produced the current key
    pub fn current_input(&self) -> Option<usize> {
        let w = *self.tree.get(1)?;
        (self.started && self.is_live(w)).then_some(w)
    }

    pub fn inputs(&self) -> &[I] {
        &self.inputs
    }
}

impl<I: KeyIterator> KeyIterator for MergeIter<I> {
    fn next(&mut self) -> Result<bool> {
        if self.failed || self.inputs.is_empty() {
            return Ok(false);
        }
        if self.started {
            let w = self.tree[1];
            if !self.is_live(w) {
                return Ok(false);
            }
            match self.inputs[w].next() {
                Ok(more) => self.live[w] = more,
                Err(err) => {
                    self.failed = true;
                    return Err(err);
                }
            }
            self.replay(w);
        }
        self.started = true;
        Ok(self.is_live(self.tree[1]))
    }

    fn key(&self) -> &Key {
        match self.current_input() {
            Some(i) => self.inputs[i].key(),
            None => &self.empty,
        }
    }

    fn value(&self) -> &[u8] {
        match self.current_input() {
            Some(i) => self.inputs[i].value(),
            None => &[],
        }
    }
}

/// In-memory sorted stream, handy for tests and small merges
#[derive(Debug, Clone, Default)]
pub struct VecIter {
    items: Vec<(Key, Vec<u8>)>,
    pos: Option<usize>,
}

impl VecIter {
    /// `items` must already be sorted by key
    pub fn new(items: Vec<(Key, Vec<u8>)>) -> Self {
        Self { items, pos: None }
    }
}

impl KeyIterator for VecIter {
    fn next(&mut self) -> Result<bool> {
        let next = self.pos.map_or(0, |p| p + 1);
        self.pos = Some(next.min(self.items.len()));
        Ok(next < self.items.len())
    }

    fn key(&self) -> &Key {
        &self.items[self.pos.unwrap_or(0)].0
    }

    fn value(&self) -> &[u8] {
        &self.items[self.pos.unwrap_or(0)].1
    }
}
