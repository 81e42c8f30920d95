use crate::sync::{AtomicPtr, AtomicU64, Ordering};
use crate::utils::CachePadded;
use core::marker::PhantomData;
use std::sync::Arc;

/// Reserved index marking the absence of a node.
const NIL: u32 = u32::MAX;

/// Nodes per first segment; segment `k` holds `SEGMENT_BASE << k` nodes.
const SEGMENT_BASE: u32 = 32;

/// Enough segments to address the whole `u32` index space.
const SEGMENT_COUNT: usize = 27;

/// Packs a node index and an ABA tag into one CAS-able word.
#[inline]
fn pack(index: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn index_of(word: u64) -> u32 {
    word as u32
}

#[inline]
fn tag_of(word: u64) -> u32 {
    (word >> 32) as u32
}

struct Node<T> {
    /// `(index, tag)` link. The tag is bumped on *every* write, so a CAS
    /// that raced with the node being recycled can never succeed against a
    /// stale expectation.
    next: AtomicU64,
    /// Raw `Arc` pointer stored by `push`. Poppers copy it before the head
    /// CAS and only the CAS winner takes ownership, which makes reads of a
    /// concurrently recycled node harmless: the loser discards the copy
    /// without dereferencing it.
    value: AtomicPtr<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(pack(NIL, 0)),
            value: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Re-link this node, bumping the tag. Only the node's current owner
    /// (allocator or retirer) may call this.
    fn store_next(&self, index: u32) {
        let tag = tag_of(self.next.load(Ordering::Relaxed));
        self.next
            .store(pack(index, tag.wrapping_add(1)), Ordering::Relaxed);
    }
}

/// Lock-free multi-producer multi-consumer FIFO of `Arc<T>` values.
///
/// A Michael–Scott queue with a permanent sentinel. Node storage is a
/// segmented, append-only arena recycled through a Treiber freelist; nodes
/// are never returned to the allocator while the queue is alive, so a
/// racing thread may read a recycled node but never touches freed memory.
/// `head`, `tail`, the freelist top and every `next` link carry a
/// generation tag next to the index, closing the ABA window that node
/// reuse would otherwise open.
///
/// `push` is non-blocking and linearizable FIFO with respect to other
/// pushes; `pop` is non-blocking and hands distinct values to distinct
/// callers under contention.
pub(crate) struct Queue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    free: CachePadded<AtomicU64>,
    /// High-water mark of arena slots handed out by `grow`.
    allocated: AtomicU64,
    segments: [AtomicPtr<Node<T>>; SEGMENT_COUNT],
    _marker: PhantomData<Arc<T>>,
}

impl<T> Queue<T> {
    pub(crate) fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            free: CachePadded::new(AtomicU64::new(pack(NIL, 0))),
            allocated: AtomicU64::new(0),
            segments: core::array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut())),
            _marker: PhantomData,
        };
        let sentinel = queue.grow();
        queue.head.store(pack(sentinel, 0), Ordering::Relaxed);
        queue.tail.store(pack(sentinel, 0), Ordering::Relaxed);
        queue
    }

    /// Appends `value` at the tail.
    pub(crate) fn push(&self, value: Arc<T>) {
        let index = self.alloc_node();
        let node = self.node(index);
        node.value
            .store(Arc::into_raw(value).cast_mut(), Ordering::Relaxed);

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_node = self.node(index_of(tail));
            let next = tail_node.next.load(Ordering::Acquire);
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if index_of(next) == NIL {
                let linked = pack(index, tag_of(next).wrapping_add(1));
                if tail_node
                    .next
                    .compare_exchange_weak(next, linked, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    // Swing the tail; a failure means another thread helped.
                    let _ = self.tail.compare_exchange(
                        tail,
                        pack(index, tag_of(tail).wrapping_add(1)),
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                // Tail is lagging behind an already-linked node.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(index_of(next), tag_of(tail).wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Removes and returns the value at the head, or `None` when empty.
    pub(crate) fn pop(&self) -> Option<Arc<T>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let head_node = self.node(index_of(head));
            let next = head_node.next.load(Ordering::Acquire);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }
            if index_of(head) == index_of(tail) {
                if index_of(next) == NIL {
                    return None;
                }
                // A push linked its node but has not swung the tail yet.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(index_of(next), tag_of(tail).wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }
            let next_node = self.node(index_of(next));
            // Copy before the CAS: only the winner owns the reference.
            let value = next_node.value.load(Ordering::Acquire);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(index_of(next), tag_of(head).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.retire(index_of(head));
                // SAFETY: the successful head CAS transferred to us the
                // reference `push` stored into this node; every other
                // thread's copy of the pointer is discarded unread.
                return Some(unsafe { Arc::from_raw(value) });
            }
        }
    }

    /// Pops a node off the freelist, or grows the arena.
    fn alloc_node(&self) -> u32 {
        loop {
            let top = self.free.load(Ordering::Acquire);
            if index_of(top) == NIL {
                return self.grow();
            }
            let node = self.node(index_of(top));
            // `node` may be concurrently re-allocated; the tagged CAS below
            // detects that and the speculatively read link is discarded.
            let next = node.next.load(Ordering::Relaxed);
            if self
                .free
                .compare_exchange_weak(
                    top,
                    pack(index_of(next), tag_of(top).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let index = index_of(top);
                self.node(index).store_next(NIL);
                return index;
            }
        }
    }

    /// Returns a popped node to the freelist.
    fn retire(&self, index: u32) {
        let node = self.node(index);
        loop {
            let top = self.free.load(Ordering::Relaxed);
            node.store_next(index_of(top));
            if self
                .free
                .compare_exchange_weak(
                    top,
                    pack(index, tag_of(top).wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Claims a fresh arena slot, installing its segment if needed.
    fn grow(&self) -> u32 {
        let index = self.allocated.fetch_add(1, Ordering::Relaxed);
        assert!(index < u64::from(NIL), "queue arena exhausted");
        let index = index as u32;
        let (segment, _) = position_of(index);
        if self.segments[segment].load(Ordering::Acquire).is_null() {
            self.install_segment(segment);
        }
        index
    }

    #[cold]
    fn install_segment(&self, segment: usize) {
        let len = (SEGMENT_BASE as usize) << segment;
        let nodes: Box<[Node<T>]> = (0..len).map(|_| Node::new()).collect();
        let ptr = Box::into_raw(nodes) as *mut Node<T>;
        if self.segments[segment]
            .compare_exchange(
                core::ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Another thread installed this segment first.
            // SAFETY: `ptr` came from `Box::into_raw` above and was never
            // published.
            drop(unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr, len)) });
        }
    }

    fn node(&self, index: u32) -> &Node<T> {
        let (segment, offset) = position_of(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "node index outside installed segments");
        // SAFETY: `index` was handed out by `grow`, which installs the
        // owning segment before returning, and segments are never freed
        // while the queue is alive.
        unsafe { &*base.add(offset) }
    }
}

/// Maps a node index to its `(segment, offset)` position.
#[inline]
fn position_of(index: u32) -> (usize, usize) {
    let q = index / SEGMENT_BASE + 1;
    let segment = 31 - q.leading_zeros();
    let offset = index - SEGMENT_BASE * ((1 << segment) - 1);
    (segment as usize, offset as usize)
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Release every value still queued, then the arena itself.
        while self.pop().is_some() {}
        for (segment, slot) in self.segments.iter().enumerate() {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let len = (SEGMENT_BASE as usize) << segment;
            // SAFETY: installed segments were produced by `Box::into_raw`
            // of a `len`-element boxed slice in `install_segment`.
            drop(unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr, len)) });
        }
    }
}
