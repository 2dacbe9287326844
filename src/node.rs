//! Interior nodes: fixed-fanout slot arrays plus an embedded lock/delete/count
//! state word and a parent back-pointer.
//!
//! Node records are laid out as a small fixed header (`NodeHeader`) followed
//! immediately by `fanout` slot words — a flexible-array-member layout, not a
//! Rust-native unsized type, because the fanout is chosen at allocation time
//! from just two possible values (root vs. every other level) and threading
//! that through a DST would buy nothing here.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::alloc::Allocator;

/// Slot fanout of the root interior node.
pub const ROOT_FANOUT: usize = 64;
/// Slot fanout of every non-root interior node.
pub const LEVEL_FANOUT: usize = 16;

/// High bit of the state word: at most one writer holds this node.
pub const LOCKED: u32 = 1 << 31;
/// Second-highest bit: the node has been unlinked from the root and must
/// never be relinked. Monotonic — once set, never cleared.
pub const DELETED: u32 = 1 << 30;
/// Remaining bits: count of populated slots.
pub const COUNT_MASK: u32 = (1 << 30) - 1;

#[repr(C)]
struct NodeHeader {
    state: AtomicU32,
    parent: AtomicUsize,
}

fn header_len() -> usize {
    size_of::<NodeHeader>()
}

/// Byte length of a node allocation with the given fanout, for allocating
/// and for `free`/reclamation bookkeeping.
pub fn alloc_len(fanout: usize) -> usize {
    header_len() + fanout * size_of::<usize>()
}

unsafe fn slots_ptr(header: *const NodeHeader) -> *const AtomicUsize {
    (header as *const u8).add(header_len()) as *const AtomicUsize
}

/// Allocate and zero-initialize a new interior node, returned already
/// `LOCKED` — the caller owns it from the moment it's created and is
/// expected to unlock it once its contents are safe to publish.
///
/// # Safety
/// `base` must be the map's base address and `ops` the map's allocator.
pub unsafe fn create(base: usize, ops: &dyn Allocator, parent_offset: usize, fanout: usize) -> Option<usize> {
    let off = ops.alloc(alloc_len(fanout));
    if off == 0 {
        return None;
    }
    let ptr = (base + off) as *mut NodeHeader;
    std::ptr::write(
        ptr,
        NodeHeader {
            state: AtomicU32::new(LOCKED),
            parent: AtomicUsize::new(parent_offset),
        },
    );
    let slots = slots_ptr(ptr as *const NodeHeader) as *mut AtomicUsize;
    for i in 0..fanout {
        std::ptr::write(slots.add(i), AtomicUsize::new(0));
    }
    Some(off)
}

/// Borrowed, lifetime-checked view of a live interior node at a known
/// offset. Safe to construct for both reader and writer paths; locking
/// discipline is enforced by debug assertions, not by the type system (the
/// map is concurrent: two `NodeView`s can alias the same node from
/// different threads by design).
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    header: &'a NodeHeader,
    slots: *const AtomicUsize,
    fanout: usize,
}

impl<'a> NodeView<'a> {
    /// # Safety
    /// `offset` must name a live interior node allocated with `fanout` at
    /// `base`, outliving `'a`.
    pub unsafe fn at(base: usize, offset: usize, fanout: usize) -> NodeView<'a> {
        let ptr = (base + offset) as *const NodeHeader;
        NodeView {
            header: &*ptr,
            slots: slots_ptr(ptr),
            fanout,
        }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn slot(&self, i: usize) -> &'a AtomicUsize {
        debug_assert!(i < self.fanout);
        unsafe { &*self.slots.add(i) }
    }

    pub fn parent_offset(&self) -> usize {
        self.header.parent.load(Ordering::Acquire)
    }

    fn raw_state(&self, order: Ordering) -> u32 {
        self.header.state.load(order)
    }

    pub fn count(&self) -> u32 {
        self.raw_state(Ordering::Acquire) & COUNT_MASK
    }

    pub fn is_deleted(&self) -> bool {
        self.raw_state(Ordering::Acquire) & DELETED != 0
    }

    /// Spin-CAS the lock bit into the state word, backing off between
    /// failed attempts. The successful CAS carries acquire-release
    /// semantics: acquire for whatever this writer is about to read,
    /// release for whatever the previous owner published before unlocking.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            let cur = self.header.state.load(Ordering::Relaxed);
            if cur & LOCKED == 0
                && self
                    .header
                    .state
                    .compare_exchange_weak(cur, cur | LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Release the lock. Writes performed under the lock must already be
    /// visible to the store below, so a release fence precedes it.
    pub fn unlock(&self) {
        let cur = self.header.state.load(Ordering::Relaxed);
        debug_assert!(cur & LOCKED != 0, "unlock() on a node that wasn't locked");
        std::sync::atomic::fence(Ordering::Release);
        self.header.state.store(cur & !LOCKED, Ordering::Release);
    }

    /// Mark the node `DELETED`. Must be called while holding the lock; the
    /// bit becomes visible to other writers only once `unlock` runs its
    /// release fence. Readers never inspect this bit.
    pub fn mark_deleted(&self) {
        let cur = self.header.state.load(Ordering::Relaxed);
        debug_assert!(cur & LOCKED != 0);
        debug_assert!(cur & DELETED == 0, "DELETED must only ever be set once");
        self.header.state.store(cur | DELETED, Ordering::Relaxed);
    }

    /// Publish `child` into `slot`, incrementing `COUNT`.
    ///
    /// Precondition: this node is `LOCKED`, not `DELETED`, and `slot` is
    /// currently empty.
    pub fn insert(&self, slot: usize, child: usize) {
        let cur = self.header.state.load(Ordering::Relaxed);
        debug_assert!(cur & LOCKED != 0 && cur & DELETED == 0);
        debug_assert_eq!(self.slot(slot).load(Ordering::Relaxed), 0, "slot not empty");
        self.slot(slot).store(child, Ordering::Relaxed);
        // LOCKED is set and DELETED is clear, so a plain +1 on the whole
        // word updates COUNT correctly without disturbing either flag.
        self.header.state.store(cur + 1, Ordering::Relaxed);
    }

    /// Clear `slot`, decrementing `COUNT`.
    ///
    /// Precondition: this node is `LOCKED`, not `DELETED`, and `slot` is
    /// currently occupied.
    pub fn remove(&self, slot: usize) {
        let cur = self.header.state.load(Ordering::Relaxed);
        debug_assert!(cur & LOCKED != 0 && cur & DELETED == 0);
        debug_assert_ne!(self.slot(slot).load(Ordering::Relaxed), 0, "slot already empty");
        self.slot(slot).store(0, Ordering::Relaxed);
        self.header.state.store(cur - 1, Ordering::Relaxed);
    }

    /// Overwrite `slot` in place without touching `COUNT` — used only when
    /// publishing the interior node that replaces a colliding leaf: the slot
    /// goes from "one non-zero entry" to "a different non-zero entry", so
    /// the populated-slot count doesn't change.
    pub fn replace_in_place(&self, slot: usize, new_value: usize) {
        debug_assert_ne!(self.slot(slot).load(Ordering::Relaxed), 0);
        self.slot(slot).store(new_value, Ordering::Release);
    }
}

/// `word & 1 == 0` ⇒ slot holds an interior node (or is empty when the whole
/// word is zero); set ⇒ slot holds a leaf.
pub const LEAF_TAG: usize = 1;

#[inline]
pub fn is_interior(word: usize) -> bool {
    word & LEAF_TAG == 0
}

/// Non-empty and untagged: a live interior-node pointer, as opposed to an
/// empty slot (both satisfy `is_interior`, since `0 & 1 == 0`).
#[inline]
pub fn is_subtree(word: usize) -> bool {
    word != 0 && is_interior(word)
}

#[inline]
pub fn is_leaf(word: usize) -> bool {
    word & LEAF_TAG != 0
}

#[inline]
pub fn clear_tag(word: usize) -> usize {
    word & !LEAF_TAG
}

#[inline]
pub fn tag_leaf(offset: usize) -> usize {
    debug_assert_eq!(offset & 0b11, 0, "leaf offset must be 4-byte aligned");
    offset | LEAF_TAG
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemAllocator;

    #[test]
    fn create_zeroes_all_slots() {
        let ops = SystemAllocator;
        unsafe {
            let off = create(0, &ops, 0, LEVEL_FANOUT).unwrap();
            let view = NodeView::at(0, off, LEVEL_FANOUT);
            assert_eq!(view.count(), 0);
            for i in 0..LEVEL_FANOUT {
                assert_eq!(view.slot(i).load(Ordering::Relaxed), 0);
            }
            ops.free(off, alloc_len(LEVEL_FANOUT));
        }
    }

    #[test]
    fn insert_and_remove_track_count() {
        let ops = SystemAllocator;
        unsafe {
            let off = create(0, &ops, 0, LEVEL_FANOUT).unwrap();
            let view = NodeView::at(0, off, LEVEL_FANOUT);
            view.insert(3, tag_leaf(64));
            assert_eq!(view.count(), 1);
            view.remove(3);
            assert_eq!(view.count(), 0);
            view.unlock();
            ops.free(off, alloc_len(LEVEL_FANOUT));
        }
    }

    #[test]
    fn lock_excludes_concurrent_lockers() {
        let ops = SystemAllocator;
        unsafe {
            let off = create(0, &ops, 0, LEVEL_FANOUT).unwrap();
            let view = NodeView::at(0, off, LEVEL_FANOUT);
            // Already locked by `create`.
            assert_ne!(view.raw_state(Ordering::Relaxed) & LOCKED, 0);
            view.unlock();
            view.lock();
            assert_ne!(view.raw_state(Ordering::Relaxed) & LOCKED, 0);
            view.unlock();
            ops.free(off, alloc_len(LEVEL_FANOUT));
        }
    }

    #[test]
    fn tag_roundtrip() {
        assert!(is_leaf(tag_leaf(128)));
        assert_eq!(clear_tag(tag_leaf(128)), 128);
        assert!(is_interior(0));
        assert!(is_interior(128));
    }
}
