//! Open-addressed hash table with jump-distance probe chains.
//!
//! Every slot carries a meta byte: bit 7 marks occupancy, bit 6 marks a list
//! continuation (an entry living away from its own bucket) and the low six
//! bits index [`JUMPS`], the offset to the next entry of the same chain
//! (0 ends the chain). An occupied slot without the list bit always sits in
//! the bucket its key hashes to, so a lookup only ever walks one chain.

use crate::types::HashKey;

const EMPTY: u8 = 0x00;
const OCCUPIED: u8 = 0x80;
const LIST: u8 = 0x40;
const JUMP_MASK: u8 = 0x3F;
/// Freed direct-hit bucket that must not be reused while a chain is re-linked
const RESERVED: u8 = 0x3F;

const GOLDEN: u64 = 11_400_714_819_323_198_485;
const MIN_SLOTS: usize = 16;
const MAX_LOAD: f64 = 0.9;

/// Probe offsets: 0..=15, then triangular numbers 21, 28, ..., 1431
pub const JUMPS: [usize; 64] = jump_table();

const fn jump_table() -> [usize; 64] {
    let mut t = [0usize; 64];
    let mut i = 0;
    while i < 64 {
        t[i] = if i < 16 {
            i
        } else {
            let n = i - 10;
            n * (n + 1) / 2
        };
        i += 1;
    }
    t
}

/// Map from a fixed-width hash to a small copyable value
#[derive(Debug, Clone)]
pub struct HashTable<K, V> {
    metas: Vec<u8>,
    keys: Vec<K>,
    values: Vec<V>,
    len: usize,
    shift: u32,
}

impl<K: HashKey, V: Copy + Default> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HashKey, V: Copy + Default> HashTable<K, V> {
    pub fn new() -> Self {
        Self {
            metas: Vec::new(),
            keys: Vec::new(),
            values: Vec::new(),
            len: 0,
            shift: 64,
        }
    }

    /// Pre-size for `n` entries
    pub fn with_capacity(n: usize) -> Self {
        let mut t = Self::new();
        let slots = ((n as f64 / MAX_LOAD).ceil() as usize)
            .next_power_of_two()
            .max(MIN_SLOTS);
        t.resize(slots);
        t
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots
    pub fn slots(&self) -> usize {
        self.metas.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.metas.len() - 1
    }

    #[inline]
    fn bucket(&self, key: &K) -> usize {
        (GOLDEN.wrapping_mul(key.bucket_hash()) >> self.shift) as usize
    }

    #[inline]
    fn next_in_chain(&self, slot: usize) -> Option<usize> {
        let j = (self.metas[slot] & JUMP_MASK) as usize;
        if j == 0 {
            None
        } else {
            Some((slot + JUMPS[j]) & self.mask())
        }
    }

    /// Look up a key
    pub fn get(&self, key: &K) -> Option<V> {
        if self.metas.is_empty() {
            return None;
        }
        let mut slot = self.bucket(key);
        let meta = self.metas[slot];
        if meta & OCCUPIED == 0 || meta & LIST != 0 {
            return None;
        }
        loop {
            if self.keys[slot] == *key {
                return Some(self.values[slot]);
            }
            slot = self.next_in_chain(slot)?;
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert unless present. Returns the stored value and whether it was
    /// newly inserted; an existing value is never overwritten.
    pub fn insert(&mut self, key: K, value: V) -> (V, bool) {
        if let Some(existing) = self.get(&key) {
            return (existing, false);
        }
        loop {
            if self.metas.is_empty() || (self.len + 1) as f64 > MAX_LOAD * self.slots() as f64 {
                self.grow();
            }
            if let Some(result) = self.try_insert(key, value) {
                return result;
            }
            self.grow();
        }
    }

    /// `None` means no free slot was reachable and the table must grow
    fn try_insert(&mut self, key: K, value: V) -> Option<(V, bool)> {
        let home = self.bucket(&key);
        let meta = self.metas[home];

        if meta == EMPTY {
            self.place(home, key, value, OCCUPIED);
            return Some((value, true));
        }
        if meta & OCCUPIED == 0 {
            // reserved buckets only exist inside `displace`
            return None;
        }
        if meta & LIST != 0 {
            return self.displace(home, key, value);
        }

        let mut tail = home;
        loop {
            if self.keys[tail] == key {
                return Some((self.values[tail], false));
            }
            match self.next_in_chain(tail) {
                Some(next) => tail = next,
                None => break,
            }
        }
        self.link_after(tail, key, value).map(|_| (value, true))
    }

    #[inline]
    fn place(&mut self, slot: usize, key: K, value: V, meta: u8) {
        self.metas[slot] = meta;
        self.keys[slot] = key;
        self.values[slot] = value;
        self.len += 1;
    }

    /// Place a chain member at the first free jump offset from `parent`
    fn link_after(&mut self, parent: usize, key: K, value: V) -> Option<usize> {
        let mask = self.mask();
        for (j, jump) in JUMPS.iter().enumerate().skip(1) {
            let slot = (parent + jump) & mask;
            if self.metas[slot] == EMPTY {
                self.place(slot, key, value, OCCUPIED | LIST);
                self.metas[parent] = (self.metas[parent] & !JUMP_MASK) | j as u8;
                return Some(slot);
            }
        }
        None
    }

    /// `home` holds a continuation of another bucket's chain: move that chain
    /// suffix elsewhere so `key` can take its direct hit.
    fn displace(&mut self, home: usize, key: K, value: V) -> Option<(V, bool)> {
        let owner = self.bucket(&self.keys[home]);

        let mut parent = owner;
        loop {
            match self.next_in_chain(parent) {
                Some(next) if next == home => break,
                Some(next) => parent = next,
                None => {
                    debug_assert!(false, "continuation not reachable from its bucket");
                    return None;
                }
            }
        }

        let mut moved = Vec::new();
        let mut slot = Some(home);
        while let Some(s) = slot {
            slot = self.next_in_chain(s);
            moved.push((self.keys[s], self.values[s]));
            self.metas[s] = EMPTY;
            self.keys[s] = K::default();
            self.values[s] = V::default();
            self.len -= 1;
        }
        self.metas[parent] &= !JUMP_MASK;
        self.metas[home] = RESERVED;

        let mut tail = parent;
        for (i, (k, v)) in moved.iter().enumerate() {
            match self.link_after(tail, *k, *v) {
                Some(s) => tail = s,
                None => {
                    self.metas[home] = EMPTY;
                    let pending: Vec<(K, V)> = moved[i..].to_vec();
                    self.grow();
                    for (k, v) in pending {
                        self.insert(k, v);
                    }
                    return Some(self.insert(key, value));
                }
            }
        }

        self.metas[home] = EMPTY;
        self.place(home, key, value, OCCUPIED);
        Some((value, true))
    }

    fn resize(&mut self, slots: usize) {
        debug_assert!(slots.is_power_of_two());
        self.metas = vec![EMPTY; slots];
        self.keys = vec![K::default(); slots];
        self.values = vec![V::default(); slots];
        self.len = 0;
        self.shift = 64 - slots.trailing_zeros();
    }

    fn grow(&mut self) {
        let slots = (self.slots() * 2).max(MIN_SLOTS);
        let metas = std::mem::take(&mut self.metas);
        let keys = std::mem::take(&mut self.keys);
        let values = std::mem::take(&mut self.values);
        self.resize(slots);

        for ((meta, key), value) in metas.into_iter().zip(keys).zip(values) {
            if meta & OCCUPIED != 0 {
                self.insert(key, value);
            }
        }
    }

    /// Occupied entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.metas
            .iter()
            .zip(self.keys.iter().zip(self.values.iter()))
            .filter(|(m, _)| **m & OCCUPIED != 0)
            .map(|(_, kv)| kv)
    }

    /// Every chain member hashes to its chain's head and every occupied slot
    /// is reachable from exactly one head.
    pub fn check_chains(&self) -> bool {
        let mut reached = 0usize;
        for head in 0..self.slots() {
            let meta = self.metas[head];
            if meta & OCCUPIED == 0 || meta & LIST != 0 {
                continue;
            }
            let mut slot = Some(head);
            while let Some(s) = slot {
                if self.metas[s] & OCCUPIED == 0 || self.bucket(&self.keys[s]) != head {
                    return false;
                }
                reached += 1;
                if reached > self.len {
                    return false;
                }
                slot = self.next_in_chain(s);
            }
        }
        reached == self.len
    }
}
