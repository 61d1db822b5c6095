//! Append-only arenas addressed by 32-bit handles
//!
//! An arena owns its elements for its whole lifetime and hands out plain
//! `u32` handles. Interior-linked structures (histogram layers, B+ tree
//! pages, name spans) refer to each other by handle instead of by pointer.

use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Elements per block of a [`BatchedArena`]
pub const BLOCK_SIZE: usize = 1024;

/// Index of an arena element
pub type Handle = u32;

/// Outer directory of block pointers; replaced (never mutated in size) on growth
struct Directory<T> {
    blocks: Box<[AtomicPtr<T>]>,
}

/// Storage owned by the arena; only touched under the growth lock
struct Owned<T> {
    blocks: Vec<Box<[T]>>,
    // retired directories stay alive so readers holding an old one remain valid
    directories: Vec<Box<Directory<T>>>,
}

/// Concurrent bump allocator over fixed 1024-element blocks.
///
/// `alloc` is a single atomic increment unless it crosses into a block that
/// does not exist yet; that slow path allocates under a mutex. `get` never
/// blocks. Element addresses are stable for the arena's lifetime, so mutation
/// through a handle goes through the element's own interior mutability
/// (atomics).
pub struct BatchedArena<T> {
    next: AtomicU32,
    ready: AtomicU32,
    directory: AtomicPtr<Directory<T>>,
    owned: Mutex<Owned<T>>,
}

// SAFETY: elements are only reachable as `&T` (or `&mut T` through `&mut self`),
// and the raw pointers reference heap blocks owned by `owned`.
unsafe impl<T: Send> Send for BatchedArena<T> {}
unsafe impl<T: Send + Sync> Sync for BatchedArena<T> {}

impl<T: Default> Default for BatchedArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> BatchedArena<T> {
    /// Create an empty arena; the first block is allocated lazily
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            ready: AtomicU32::new(0),
            directory: AtomicPtr::new(ptr::null_mut()),
            owned: Mutex::new(Owned {
                blocks: Vec::new(),
                directories: Vec::new(),
            }),
        }
    }

    /// Reserve a fresh default-initialised element
    pub fn alloc(&self) -> Handle {
        let h = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(h != u32::MAX, "arena handle space exhausted");
        let block = h / BLOCK_SIZE as u32;
        if block >= self.ready.load(Ordering::Acquire) {
            self.grow(block);
        }
        h
    }

    fn grow(&self, block: u32) {
        let mut owned = self.owned.lock();
        // `ready` only changes under this lock
        while self.ready.load(Ordering::Relaxed) <= block {
            let n = owned.blocks.len();
            let current = self.directory.load(Ordering::Acquire);
            let capacity = if current.is_null() {
                0
            } else {
                // SAFETY: directories are owned by `owned` and never freed early
                unsafe { (&(*current).blocks).len() }
            };

            if n >= capacity {
                let new_capacity = (capacity * 2).max(8);
                let blocks: Box<[AtomicPtr<T>]> = (0..new_capacity)
                    .map(|i| {
                        if i < capacity {
                            // SAFETY: see above
                            AtomicPtr::new(unsafe { (*current).blocks[i].load(Ordering::Relaxed) })
                        } else {
                            AtomicPtr::new(ptr::null_mut())
                        }
                    })
                    .collect();
                let dir = Box::new(Directory { blocks });
                let dir_ptr = &*dir as *const Directory<T> as *mut Directory<T>;
                owned.directories.push(dir);
                self.directory.store(dir_ptr, Ordering::Release);
            }

            let fresh: Box<[T]> = (0..BLOCK_SIZE).map(|_| T::default()).collect();
            let elem_ptr = fresh.as_ptr() as *mut T;
            owned.blocks.push(fresh);

            let dir = self.directory.load(Ordering::Relaxed);
            // SAFETY: `dir` is the live directory, sized > n
            unsafe { (*dir).blocks[n].store(elem_ptr, Ordering::Release) };
            self.ready.store(n as u32 + 1, Ordering::Release);
        }
    }

    /// Resolve a handle previously returned by [`alloc`](Self::alloc)
    #[inline]
    pub fn get(&self, h: Handle) -> &T {
        let block = h as usize / BLOCK_SIZE;
        let slot = h as usize % BLOCK_SIZE;
        assert!(
            block < self.ready.load(Ordering::Acquire) as usize,
            "arena handle {h} out of range"
        );
        // SAFETY: the block exists (checked above) and is never freed or moved
        // while the arena lives; the directory published before `ready` holds it.
        unsafe {
            let dir = self.directory.load(Ordering::Acquire);
            let base = (*dir).blocks[block].load(Ordering::Acquire);
            &*base.add(slot)
        }
    }

    /// Exclusive access to an element
    pub fn get_mut(&mut self, h: Handle) -> &mut T {
        let block = h as usize / BLOCK_SIZE;
        let slot = h as usize % BLOCK_SIZE;
        &mut self.owned.get_mut().blocks[block][slot]
    }

    /// Number of handles handed out
    pub fn len(&self) -> usize {
        self.next.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of allocated blocks
    pub fn blocks(&self) -> usize {
        self.ready.load(Ordering::Acquire) as usize
    }
}

/// Single-threaded arena over one flat vector.
///
/// Capacity doubles on overflow and the new tail is pre-filled with default
/// values. Handles stay valid across growth; references do not.
#[derive(Debug, Clone)]
pub struct SingleArena<T> {
    items: Vec<T>,
    len: usize,
}

impl<T: Default> Default for SingleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> SingleArena<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, T::default);
        Self { items, len: 0 }
    }

    /// Reserve a default element
    pub fn alloc(&mut self) -> Handle {
        if self.len == self.items.len() {
            let capacity = (self.items.len() * 2).max(16);
            self.items.resize_with(capacity, T::default);
        }
        let h = self.len;
        self.len += 1;
        h as Handle
    }

    /// Append a value, returning its handle
    pub fn push(&mut self, value: T) -> Handle {
        let h = self.alloc();
        self.items[h as usize] = value;
        h
    }

    pub fn get(&self, h: Handle) -> Option<&T> {
        if (h as usize) < self.len {
            self.items.get(h as usize)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        if (h as usize) < self.len {
            self.items.get_mut(h as usize)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated slots, including the unused tail
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items[..self.len].iter()
    }
}
