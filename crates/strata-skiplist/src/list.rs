#![allow(unsafe_code)]
// Raw node pointers into the arena. The invariants are:
//  - nodes and their key bytes are allocated in `WriterState::arena` and are
//    never freed or moved until the last clone of the list is dropped;
//  - a node pointer obtained from a link (or the head) is either null or
//    points at a fully initialized node;
//  - links are published with store-release and read with load-acquire, so a
//    reader that observes a link also observes the node it points to.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bumpalo::Bump;
use oorandom::Rand32;

use crate::{Comparator, MAX_HEIGHT, random_node_height};


/// The seed LevelDB uses for its skiplist; kept for the fun of it.
const DEFAULT_PRNG_SEED: u64 = 0x_dead_beef;

struct Node {
    key_ptr: *const u8,
    key_len: usize,
    /// Points at `height` consecutive `AtomicPtr<Node>` links in the arena.
    /// `tower[0]` is the full-list ("next") level.
    tower:   *const AtomicPtr<Node>,
    height:  usize,
}

impl Node {
    /// SAFETY: the node must be part of a still-live list.
    unsafe fn key<'a>(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.key_ptr, self.key_len) }
    }

    /// SAFETY: `level < self.height`.
    unsafe fn link(&self, level: usize) -> &AtomicPtr<Node> {
        debug_assert!(level < self.height);
        unsafe { &*self.tower.add(level) }
    }
}

struct WriterState {
    arena: Bump,
    prng:  Rand32,
}

struct ListInner<C> {
    cmp:            C,
    /// Arena and PRNG, touched only while inserting.
    writer:         Mutex<WriterState>,
    /// Dummy node with a MAX_HEIGHT tower and no key; its key is never read.
    head:           *const Node,
    /// Height of the tallest node ever inserted. Read with relaxed ordering;
    /// a level that is listed here but not yet linked from the head simply
    /// yields a null link, which searches treat as end-of-level.
    current_height: AtomicUsize,
    /// Total arena bytes consumed by entries, nodes, and towers.
    allocated:      AtomicUsize,
}

// SAFETY: all shared mutable state is behind the writer mutex or atomics,
// and nodes reached through links are immutable after publication.
unsafe impl<C: Send> Send for ListInner<C> {}
unsafe impl<C: Send + Sync> Sync for ListInner<C> {}

/// See the [crate docs](crate) for the concurrency contract.
///
/// Cloning is cheap and shares the underlying list.
pub struct SkipList<C> {
    inner: std::sync::Arc<ListInner<C>>,
}

impl<C> Clone for SkipList<C> {
    #[inline]
    fn clone(&self) -> Self {
        Self { inner: std::sync::Arc::clone(&self.inner) }
    }
}

impl<C: Comparator> SkipList<C> {
    #[must_use]
    pub fn new(cmp: C) -> Self {
        Self::new_seeded(cmp, DEFAULT_PRNG_SEED)
    }

    #[must_use]
    pub fn new_seeded(cmp: C, seed: u64) -> Self {
        let arena = Bump::new();

        let head_tower: &[AtomicPtr<Node>] =
            arena.alloc_slice_fill_with(MAX_HEIGHT, |_| AtomicPtr::new(ptr::null_mut()));
        let head = arena.alloc(Node {
            key_ptr: ptr::null(),
            key_len: 0,
            tower:   head_tower.as_ptr(),
            height:  MAX_HEIGHT,
        });
        let head: *const Node = head;

        Self {
            inner: std::sync::Arc::new(ListInner {
                cmp,
                writer: Mutex::new(WriterState { arena, prng: Rand32::new(seed) }),
                head,
                current_height: AtomicUsize::new(1),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Insert an entry built in place: `init` is called on a zeroed buffer of
    /// `entry_len` bytes already residing in the arena.
    ///
    /// Returns `false` (and wastes the arena bytes) if the finished entry
    /// compares equal to one already present.
    ///
    /// One insert runs at a time; concurrent calls serialize on an internal
    /// lock. Readers are never blocked.
    pub fn insert_with<F: FnOnce(&mut [u8])>(&self, entry_len: usize, init: F) -> bool {
        self.inner.insert_with(entry_len, init)
    }

    /// Insert a copy of `entry`. See [`insert_with`](Self::insert_with).
    pub fn insert_copy(&self, entry: &[u8]) -> bool {
        self.insert_with(entry.len(), |buf| buf.copy_from_slice(entry))
    }

    /// Whether an entry comparing equal to `entry` is present.
    #[must_use]
    pub fn contains(&self, entry: &[u8]) -> bool {
        let geq = self.inner.find_greater_or_equal(entry, None);
        // SAFETY: node obtained from a live list.
        !geq.is_null() && self.inner.cmp.cmp(unsafe { (*geq).key() }, entry) == CmpOrdering::Equal
    }

    /// Total arena bytes consumed so far.
    #[inline]
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn iter(&self) -> Iter<'_, C> {
        Iter { list: &self.inner, node: ptr::null() }
    }

    /// An iterator that keeps the list alive by holding a clone of it.
    #[inline]
    #[must_use]
    pub fn owned_iter(&self) -> OwnedIter<C> {
        OwnedIter { list: self.clone(), node: ptr::null() }
    }
}

impl<C: Comparator> ListInner<C> {
    fn insert_with<F: FnOnce(&mut [u8])>(&self, entry_len: usize, init: F) -> bool {
        let mut writer = self.writer.lock().expect("skiplist writer lock poisoned");
        let WriterState { arena, prng } = &mut *writer;

        // Build the entry bytes first; the comparator needs them to find the
        // insertion point.
        let key: &mut [u8] = arena.alloc_slice_fill_default(entry_len);
        init(key);

        let mut prev = [ptr::null::<Node>(); MAX_HEIGHT];
        let geq = self.find_greater_or_equal(key, Some(&mut prev));

        // SAFETY: `geq` came from a link of this live list.
        if !geq.is_null() && self.cmp.cmp(unsafe { (*geq).key() }, key) == CmpOrdering::Equal {
            // Duplicate; the contract says this shouldn't happen, but losing
            // the arena bytes is the worst of it.
            return false;
        }

        let height = random_node_height(prng);
        let current_height = self.current_height.load(Ordering::Relaxed);
        if height > current_height {
            for level_prev in prev.iter_mut().take(height).skip(current_height) {
                *level_prev = self.head;
            }
            // Readers that see the new height before the head links are
            // published find null links there and just descend.
            self.current_height.store(height, Ordering::Relaxed);
        }

        let tower: &[AtomicPtr<Node>] =
            arena.alloc_slice_fill_with(height, |_| AtomicPtr::new(ptr::null_mut()));
        let node = arena.alloc(Node {
            key_ptr: key.as_ptr(),
            key_len: entry_len,
            tower:   tower.as_ptr(),
            height,
        });
        let node_ptr: *mut Node = node;

        for level in 0..height {
            // SAFETY: every `prev[level]` is the head or a node of this list,
            // with height > level by construction of the search.
            unsafe {
                let next = (*prev[level]).link(level).load(Ordering::Relaxed);
                // The node is not yet visible; relaxed is enough for its own
                // links.
                (*node_ptr).link(level).store(next, Ordering::Relaxed);
                // Publish.
                (*prev[level]).link(level).store(node_ptr, Ordering::Release);
            }
        }

        self.allocated.fetch_add(
            entry_len + size_of::<Node>() + height * size_of::<AtomicPtr<Node>>(),
            Ordering::Relaxed,
        );
        true
    }

    /// First node whose entry is `>= target`, or null. When `prev` is given,
    /// it is filled with the rightmost node strictly before `target` on every
    /// level (the head where no such node exists).
    fn find_greater_or_equal(
        &self,
        target: &[u8],
        mut prev: Option<&mut [*const Node; MAX_HEIGHT]>,
    ) -> *const Node {
        let mut level = self.current_height.load(Ordering::Relaxed) - 1;
        let mut current = self.head;

        loop {
            // SAFETY: `current` is the head or a published node; `level` is
            // below its height.
            let next = unsafe { (*current).link(level).load(Ordering::Acquire) };

            if self.node_is_before(next, target) {
                current = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = current;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node whose entry is `< target`, or the head.
    fn find_less_than(&self, target: &[u8]) -> *const Node {
        let mut level = self.current_height.load(Ordering::Relaxed) - 1;
        let mut current = self.head;

        loop {
            // SAFETY: as in `find_greater_or_equal`.
            let next = unsafe { (*current).link(level).load(Ordering::Acquire) };

            if self.node_is_before(next, target) {
                current = next;
            } else if level == 0 {
                return current;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list, or the head when empty.
    fn find_last(&self) -> *const Node {
        let mut level = self.current_height.load(Ordering::Relaxed) - 1;
        let mut current = self.head;

        loop {
            // SAFETY: as in `find_greater_or_equal`.
            let next = unsafe { (*current).link(level).load(Ordering::Acquire) };

            if !next.is_null() {
                current = next;
            } else if level == 0 {
                return current;
            } else {
                level -= 1;
            }
        }
    }

    /// Whether `node` is non-null and sorts strictly before `target`.
    fn node_is_before(&self, node: *const Node, target: &[u8]) -> bool {
        // SAFETY: non-null links point at published nodes.
        !node.is_null() && self.cmp.cmp(unsafe { (*node).key() }, target) == CmpOrdering::Less
    }

    #[inline]
    fn first(&self) -> *const Node {
        // SAFETY: the head always exists and has a full tower.
        unsafe { (*self.head).link(0).load(Ordering::Acquire) }
    }

    /// Translate "the head" into "no node".
    #[inline]
    fn or_null(&self, node: *const Node) -> *const Node {
        if node == self.head { ptr::null() } else { node }
    }
}

macro_rules! iter_impl {
    ($iter:ident $(, $lt:lifetime)?) => {
        impl<$($lt,)? C: Comparator> $iter<$($lt,)? C> {
            /// Whether the iterator is positioned at an entry.
            #[inline]
            #[must_use]
            pub fn valid(&self) -> bool {
                !self.node.is_null()
            }

            /// The entry at the current position. `None` when invalid.
            #[inline]
            #[must_use]
            pub fn current(&self) -> Option<&[u8]> {
                // SAFETY: a non-null current node belongs to the live list
                // (kept alive at least as long as `self`).
                (!self.node.is_null()).then(|| unsafe { (*self.node).key() })
            }

            /// Advance to the next entry and return it.
            pub fn next(&mut self) -> Option<&[u8]> {
                if self.node.is_null() {
                    return None;
                }
                // SAFETY: valid current node, level 0 always exists.
                self.node = unsafe { (*self.node).link(0).load(Ordering::Acquire) };
                self.current()
            }

            /// Step back to the previous entry and return it.
            ///
            /// This is a search from the top of the list, not a pointer walk.
            pub fn prev(&mut self) -> Option<&[u8]> {
                let inner = self.inner();
                if self.node.is_null() {
                    return None;
                }
                // SAFETY: valid current node.
                let key = unsafe { (*self.node).key() };
                self.node = inner.or_null(inner.find_less_than(key));
                self.current()
            }

            /// Position at the first entry `>= target`.
            pub fn seek(&mut self, target: &[u8]) {
                self.node = self.inner().find_greater_or_equal(target, None);
            }

            /// Position at the first entry.
            pub fn seek_to_first(&mut self) {
                self.node = self.inner().first();
            }

            /// Position at the last entry.
            pub fn seek_to_last(&mut self) {
                let inner = self.inner();
                self.node = inner.or_null(inner.find_last());
            }
        }
    };
}

/// A borrowing iterator over a [`SkipList`].
///
/// Invalid until the first `seek*` call. Never blocks, and never observes a
/// torn list; entries inserted after a read may or may not be seen.
pub struct Iter<'a, C> {
    list: &'a ListInner<C>,
    node: *const Node,
}

// SAFETY: an iterator only reads published nodes; see `ListInner`.
unsafe impl<C: Send + Sync> Send for Iter<'_, C> {}

impl<C> Clone for Iter<'_, C> {
    #[inline]
    fn clone(&self) -> Self {
        Self { list: self.list, node: self.node }
    }
}

impl<C> Iter<'_, C> {
    #[inline]
    fn inner(&self) -> &ListInner<C> {
        self.list
    }
}

iter_impl!(Iter, 'a);

/// Like [`Iter`], but keeps the list alive by holding a clone of it, so it
/// can outlive the handle it was created from.
pub struct OwnedIter<C> {
    list: SkipList<C>,
    node: *const Node,
}

// SAFETY: as for `Iter`; the owned clone keeps the arena alive.
unsafe impl<C: Send + Sync> Send for OwnedIter<C> {}

impl<C> Clone for OwnedIter<C> {
    #[inline]
    fn clone(&self) -> Self {
        Self { list: self.list.clone(), node: self.node }
    }
}

impl<C> OwnedIter<C> {
    #[inline]
    fn inner(&self) -> &ListInner<C> {
        &self.list.inner
    }
}

iter_impl!(OwnedIter);
