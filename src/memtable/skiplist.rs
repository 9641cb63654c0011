//! Concurrent skip-list keyed by byte strings.
//!
//! # Thread safety
//!
//! Writes require external synchronization: exactly one thread may
//! call [`SkipList::insert`] at a time. Reads need no locks and may
//! run concurrently with the writer.
//!
//! Invariants making that work:
//!
//! 1. Nodes are allocated from the arena and never removed until the
//!    list (and its arena) is dropped.
//! 2. A node's key is immutable once the node is linked in.
//! 3. Each level's forward pointer in a new node is initialized with a
//!    relaxed store, and the node is published into the list with a
//!    release store of the predecessor's pointer; readers load forward
//!    pointers with acquire ordering. A reader therefore observes
//!    either the pre-insert or post-insert state at every level.
//!
//! There are no back-pointers; stepping backwards re-descends from the
//! head with `find_less_than`.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::arena::Arena;

/// Maximum tower height.
pub const MAX_HEIGHT: usize = 12;

/// A node is promoted one level with probability 1/BRANCHING.
const BRANCHING: u32 = 4;

/// Total order over the raw key bytes stored in the list.
pub trait KeyComparator: Send + Sync {
    /// Compare two stored keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering;
}

#[repr(C)]
struct Node {
    key_ptr: *const u8,
    key_len: u32,
    height: u32,
    next: [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Node {
    fn key(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.key_ptr, self.key_len as usize) }
    }

    fn next(&self, level: usize) -> *mut Node {
        debug_assert!(level < self.height as usize);
        self.next[level].load(Ordering::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        debug_assert!(level < self.height as usize);
        self.next[level].store(node, Ordering::Release)
    }

    // Variants safe to use where the happens-before edge is provided
    // by the enclosing release store.
    fn next_relaxed(&self, level: usize) -> *mut Node {
        self.next[level].load(Ordering::Relaxed)
    }

    fn set_next_relaxed(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, Ordering::Relaxed)
    }
}

/// Skip-list over byte-string keys allocated in an arena.
///
/// Keys only; callers that need values pack them into the key bytes.
/// Duplicate keys are a contract violation — callers guarantee
/// uniqueness by embedding a sequence number.
pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the tallest tower. A stale (low) read only costs a
    /// reader some extra comparisons near the top.
    max_height: AtomicUsize,
    rng: Mutex<SmallRng>,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// Create an empty list allocating nodes from `arena`.
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        let head = Self::new_node_in(&arena, &[], MAX_HEIGHT);
        Self {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Insert `key` into the list, copying it into the arena.
    ///
    /// Requires external synchronization of writers. `key` must not
    /// compare equal to any key already in the list.
    pub fn insert(&self, key: &[u8]) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));

        debug_assert!(
            x.is_null() || self.cmp.compare(unsafe { (*x).key() }, key) != CmpOrdering::Equal,
            "duplicate key inserted into skip-list"
        );

        let height = self.random_height();
        let max_height = self.max_height.load(Ordering::Relaxed);
        if height > max_height {
            for p in prev.iter_mut().take(height).skip(max_height) {
                *p = self.head;
            }
            // A concurrent reader seeing the new height before the new
            // node's links just descends from head on the extra
            // levels.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node_in(&self.arena, key, height);
        for level in 0..height {
            unsafe {
                // The new node is not yet visible; relaxed init is
                // enough, the release below publishes it.
                (*node).set_next_relaxed(level, (*prev[level]).next_relaxed(level));
                (*prev[level]).set_next(level, node);
            }
        }
    }

    /// Whether an entry equal to `key` is in the list.
    pub fn contains(&self, key: &[u8]) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.cmp.compare(unsafe { (*x).key() }, key) == CmpOrdering::Equal
    }

    /// Create a cursor over the list.
    pub fn iter(&self) -> SkipListIterator<'_, C> {
        SkipListIterator {
            list: self,
            node: ptr::null(),
        }
    }

    fn new_node_in(arena: &Arena, key: &[u8], height: usize) -> *mut Node {
        let key_ptr = if key.is_empty() {
            ptr::NonNull::<u8>::dangling().as_ptr() as *const u8
        } else {
            arena.allocate_copy(key)
        };

        let node = arena.allocate_aligned(std::mem::size_of::<Node>()) as *mut Node;
        unsafe {
            ptr::write(
                node,
                Node {
                    key_ptr,
                    key_len: key.len() as u32,
                    height: height as u32,
                    next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
                },
            );
        }
        node
    }

    fn random_height(&self) -> usize {
        let mut rng = self.rng.lock();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }

    fn get_max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    /// True iff `key` sorts strictly after the key stored at `node`.
    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == CmpOrdering::Less
    }

    /// First node with key >= `key`, or null. Fills `prev` with the
    /// per-level predecessors when requested.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.get_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node with key < `key`, or the head node.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.get_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if level == 0 {
                    return x;
                }
                level -= 1;
            }
        }
    }

    /// Last node in the list, or the head node when empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.get_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if !next.is_null() {
                x = next;
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }
}

/// Cursor over a [`SkipList`].
pub struct SkipListIterator<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *const Node,
}

impl<'a, C: KeyComparator> SkipListIterator<'a, C> {
    /// Whether the cursor is positioned at an entry.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The key at the current position.
    ///
    /// Requires `valid()`. The slice stays valid for the lifetime of
    /// the list.
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { &*std::ptr::slice_from_raw_parts((*self.node).key_ptr, (*self.node).key_len as usize) }
    }

    /// Advance to the next entry.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Step back to the previous entry; invalid when already at the
    /// first one.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let before = self.list.find_less_than(self.key());
        self.node = if before == self.list.head {
            ptr::null()
        } else {
            before
        };
    }

    /// Position at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if last == self.list.head {
            ptr::null()
        } else {
            last
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Clone, Copy)]
    struct BytewiseKeyComparator;

    impl KeyComparator for BytewiseKeyComparator {
        fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
            a.cmp(b)
        }
    }

    fn new_list() -> SkipList<BytewiseKeyComparator> {
        SkipList::new(BytewiseKeyComparator, Arc::new(Arena::new()))
    }

    #[test]
    fn test_empty_list() {
        let list = new_list();
        assert!(!list.contains(b"anything"));

        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"foo");
        assert!(!iter.valid());
    }

    #[test]
    fn test_insert_and_lookup() {
        let list = new_list();
        let keys: &[&[u8]] = &[b"delta", b"alpha", b"echo", b"bravo", b"charlie"];
        for key in keys {
            list.insert(key);
        }

        for key in keys {
            assert!(list.contains(key));
        }
        assert!(!list.contains(b"foxtrot"));

        // Forward iteration is sorted
        let mut iter = list.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charlie".to_vec(),
                b"delta".to_vec(),
                b"echo".to_vec()
            ]
        );
    }

    #[test]
    fn test_seek_semantics() {
        let list = new_list();
        for key in [b"b".as_slice(), b"d", b"f"] {
            list.insert(key);
        }

        let mut iter = list.iter();

        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"b");

        iter.seek(b"d");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"d");

        iter.seek(b"e");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"f");

        iter.seek(b"g");
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let list = new_list();
        for key in [b"one".as_slice(), b"three", b"two"] {
            list.insert(key);
        }

        let mut iter = list.iter();
        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"two");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"three");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"one");

        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_many_keys_sorted() {
        let list = new_list();
        let mut keys: Vec<Vec<u8>> = (0..2000u32)
            .map(|i| format!("key{:08}", i.wrapping_mul(2_654_435_761) % 100_000).into_bytes())
            .collect();
        keys.sort();
        keys.dedup();

        for key in &keys {
            list.insert(key);
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        for key in &keys {
            assert!(iter.valid());
            assert_eq!(iter.key(), &key[..]);
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_single_writer_concurrent_readers() {
        let list = Arc::new(new_list());
        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();

        for _ in 0..4 {
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let mut iter = list.iter();
                    iter.seek_to_first();
                    let mut last: Option<Vec<u8>> = None;
                    while iter.valid() {
                        let key = iter.key().to_vec();
                        if let Some(prev) = &last {
                            assert!(prev < &key, "out-of-order keys observed");
                        }
                        last = Some(key);
                        iter.next();
                    }
                }
            }));
        }

        // Single writer
        for i in 0..5000u32 {
            list.insert(format!("key{:08}", i).as_bytes());
        }
        stop.store(true, Ordering::Relaxed);

        for r in readers {
            r.join().unwrap();
        }

        assert!(list.contains(b"key00000000"));
        assert!(list.contains(b"key00004999"));
    }
}
