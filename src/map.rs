//! The map handle and the three operations (`get`/`put`/`del`) built on top
//! of the traversal, node and leaf primitives, plus construction/destruction
//! and the GC drain.

use std::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use log::{debug, trace};

use crate::alloc::{Allocator, SystemAllocator};
use crate::error::CreateError;
use crate::hash::{Cursor, HashFn, Murmur3Hash};
use crate::leaf::{self, LeafView};
use crate::node::{self, NodeView};
use crate::reclaim::ReclaimQueue;

bitflags! {
    /// Construction-time flags.
    pub struct Flags: u32 {
        /// Keys are *not* copied into the map; the caller's pointer is
        /// stored verbatim and must outlive the entry.
        const NOCOPY = 1 << 0;
    }
}

/// A concurrent trie-hash map keyed by arbitrary byte strings.
///
/// Reads ([`ThMap::get`]) are lock-free. Writes ([`ThMap::put`],
/// [`ThMap::del`]) take per-node spinlocks, holding at most one node locked
/// at a time except while an insert is publishing a freshly-created child.
/// Deletions that empty out an interior node stage it for deferred
/// reclamation rather than freeing it synchronously — see [`ThMap::gc`].
pub struct ThMap {
    base: usize,
    root_offset: usize,
    ops: Box<dyn Allocator>,
    hash: Box<dyn HashFn>,
    flags: Flags,
    reclaim: ReclaimQueue,
}

/// The result of descending to the position a key currently occupies (or
/// would occupy): the interior node whose slot is relevant, and the cursor
/// state needed to keep descending from there (used by insert's expansion
/// loop and delete's collapse loop).
struct EdgeNode {
    offset: usize,
    fanout: usize,
    slot: usize,
    cursor: Cursor,
}

impl ThMap {
    /// Construct a new map.
    ///
    /// `base` must be 4-byte aligned: every slot word stored by the map
    /// reserves its low two bits for the tag discipline. `ops` defaults to
    /// a process-heap allocator (valid only when `base == 0`); `hash`
    /// defaults to the built-in MurmurHash3 variant.
    pub fn create(
        base: usize,
        ops: Option<Box<dyn Allocator>>,
        hash: Option<Box<dyn HashFn>>,
        flags: Flags,
    ) -> Result<ThMap, CreateError> {
        if base & 0b11 != 0 {
            return Err(CreateError::MisalignedBase);
        }
        let ops = ops.unwrap_or_else(|| Box::new(SystemAllocator));
        let hash = hash.unwrap_or_else(|| Box::new(Murmur3Hash));

        let root_offset = unsafe { node::create(base, ops.as_ref(), 0, node::ROOT_FANOUT) }
            .ok_or(CreateError::OutOfMemory)?;
        // Nothing else can observe the root before `create` returns, so
        // unlock it immediately; `node::create` hands back nodes locked by
        // convention (the same convention the expansion loop relies on).
        unsafe { NodeView::at(base, root_offset, node::ROOT_FANOUT) }.unlock();

        debug!(
            "thmap: created map at base={:#x}, root_offset={:#x}, flags={:?}",
            base, root_offset, flags
        );

        Ok(ThMap {
            base,
            root_offset,
            ops,
            hash,
            flags,
            reclaim: ReclaimQueue::new(),
        })
    }

    fn nocopy(&self) -> bool {
        self.flags.contains(Flags::NOCOPY)
    }

    fn root(&self) -> NodeView<'_> {
        unsafe { NodeView::at(self.base, self.root_offset, node::ROOT_FANOUT) }
    }

    fn node_at(&self, offset: usize, fanout: usize) -> NodeView<'_> {
        unsafe { NodeView::at(self.base, offset, fanout) }
    }

    fn leaf_at(&self, offset: usize) -> LeafView<'_> {
        unsafe { LeafView::at(self.base, offset, self.nocopy()) }
    }

    /// Lock-free descent from the root to the interior node whose slot a
    /// key currently occupies (or would occupy, if absent).
    fn find_edge_node(&self, key: &[u8]) -> EdgeNode {
        let mut cursor = Cursor::new();
        let mut offset = self.root_offset;
        let mut fanout = node::ROOT_FANOUT;
        let mut node = self.node_at(offset, fanout);
        let mut slot = cursor.slot(key, self.hash.as_ref());
        let mut word = node.slot(slot).load(Ordering::Relaxed);

        while node::is_subtree(word) {
            cursor.descend();
            offset = node::clear_tag(word);
            fanout = cursor.fanout();
            // Pairs with the release fence an inserter emits before
            // publishing a new interior node into the slot we just read.
            fence(Ordering::Acquire);
            node = self.node_at(offset, fanout);
            slot = cursor.slot(key, self.hash.as_ref());
            word = node.slot(slot).load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);

        EdgeNode {
            offset,
            fanout,
            slot,
            cursor,
        }
    }

    /// Descend lock-free, then lock the edge node and re-check that it is
    /// still a valid place to mutate, retrying from the root on failure.
    /// Returns the locked edge node plus the slot word observed under lock.
    fn find_edge_node_locked(&self, key: &[u8]) -> (EdgeNode, usize) {
        loop {
            let edge = self.find_edge_node(key);
            let parent = self.node_at(edge.offset, edge.fanout);
            parent.lock();
            let word = parent.slot(edge.slot).load(Ordering::Acquire);
            if parent.is_deleted() || node::is_subtree(word) {
                trace!(
                    "thmap: edge node retry (deleted={}, became_subtree={})",
                    parent.is_deleted(),
                    node::is_subtree(word)
                );
                parent.unlock();
                continue;
            }
            return (edge, word);
        }
    }

    /// Lock-free lookup. Returns the stored value, or `None` if the key is
    /// absent.
    pub fn get(&self, key: &[u8]) -> Option<usize> {
        let edge = self.find_edge_node(key);
        let parent = self.node_at(edge.offset, edge.fanout);
        let word = parent.slot(edge.slot).load(Ordering::Acquire);
        if !node::is_leaf(word) {
            return None;
        }
        let leaf = self.leaf_at(node::clear_tag(word));
        if leaf.key_matches(key) {
            Some(leaf.val())
        } else {
            None
        }
    }

    /// Insert `(key, val)`. If `key` is already present, the *existing*
    /// value is returned and the map is left unchanged; callers distinguish
    /// a fresh insert from a duplicate by comparing the returned value
    /// against `val`. Returns `None` only on OOM.
    pub fn put(&self, key: &[u8], val: usize) -> Option<usize> {
        let nocopy = self.nocopy();
        let leaf_off = unsafe { leaf::create(self.base, self.ops.as_ref(), key, val, nocopy) }?;

        loop {
            let (edge, word) = self.find_edge_node_locked(key);
            let parent = self.node_at(edge.offset, edge.fanout);

            if word == 0 {
                parent.insert(edge.slot, node::tag_leaf(leaf_off));
                parent.unlock();
                return Some(val);
            }

            let other_off = node::clear_tag(word);
            let other = self.leaf_at(other_off);
            if other.key_matches(key) {
                let existing = other.val();
                parent.unlock();
                unsafe { leaf::free(self.base, self.ops.as_ref(), leaf_off, nocopy) };
                return Some(existing);
            }

            // Collision: expand one or more levels until the two keys land
            // on distinct slots.
            return self.expand(
                parent,
                edge.offset,
                edge.slot,
                edge.cursor,
                other_off,
                leaf_off,
                val,
                key,
            );
        }
    }

    /// The expansion loop from 4.7 step 4: iteratively push the colliding
    /// leaf (`other_off`) and the new leaf (`new_leaf_off`, storing `val`)
    /// apart by creating interior nodes until they land on distinct slots.
    ///
    /// `collision_parent` (at `collision_offset`) must already be locked
    /// and hold a leaf at `collision_slot` whose key differs from `key`.
    #[allow(clippy::too_many_arguments)]
    fn expand(
        &self,
        mut collision_parent: NodeView<'_>,
        mut collision_offset: usize,
        mut collision_slot: usize,
        cursor: Cursor,
        other_off: usize,
        new_leaf_off: usize,
        val: usize,
        key: &[u8],
    ) -> Option<usize> {
        let nocopy = self.nocopy();
        let other = self.leaf_at(other_off);
        let mut key_cursor = cursor;
        let mut other_cursor = Cursor::at_level(cursor.level());

        loop {
            let child_off =
                match unsafe { node::create(self.base, self.ops.as_ref(), collision_offset, node::LEVEL_FANOUT) }
                {
                    Some(o) => o,
                    None => {
                        collision_parent.unlock();
                        unsafe { leaf::free(self.base, self.ops.as_ref(), new_leaf_off, nocopy) };
                        return None;
                    }
                };

            key_cursor.descend();
            other_cursor.descend();
            let child = self.node_at(child_off, node::LEVEL_FANOUT);
            let other_slot = other_cursor.slot(other.key(), self.hash.as_ref());
            child.insert(other_slot, node::tag_leaf(other_off));

            // The leaf-in-child store above must be globally visible before
            // we publish `child` into the parent's slot.
            fence(Ordering::Release);
            collision_parent.replace_in_place(collision_slot, child_off);
            collision_parent.unlock();
            debug!(
                "thmap: expanded interior node at level {}",
                key_cursor.level()
            );

            let new_slot = key_cursor.slot(key, self.hash.as_ref());
            if new_slot == other_slot {
                collision_parent = child;
                collision_offset = child_off;
                collision_slot = new_slot;
                continue;
            }

            child.insert(new_slot, node::tag_leaf(new_leaf_off));
            child.unlock();
            return Some(val);
        }
    }

    /// Remove `key`. Returns the removed value, or `None` if absent.
    /// Collapses any interior nodes whose populated count drops to zero as
    /// a result, staging them for deferred reclamation.
    pub fn del(&self, key: &[u8]) -> Option<usize> {
        let (edge, word) = self.find_edge_node_locked(key);
        let mut current = self.node_at(edge.offset, edge.fanout);

        if !node::is_leaf(word) {
            current.unlock();
            return None;
        }
        let leaf_off = node::clear_tag(word);
        let leaf = self.leaf_at(leaf_off);
        if !leaf.key_matches(key) {
            current.unlock();
            return None;
        }

        current.remove(edge.slot);

        let mut current_offset = edge.offset;
        let mut cursor = edge.cursor;

        while current_offset != self.root_offset && current.count() == 0 {
            cursor.ascend();
            let gp_slot = cursor.slot(key, self.hash.as_ref());
            let gp_offset = current.parent_offset();
            let gp_fanout = if gp_offset == self.root_offset {
                node::ROOT_FANOUT
            } else {
                node::LEVEL_FANOUT
            };
            let grandparent = self.node_at(gp_offset, gp_fanout);
            grandparent.lock();
            debug_assert!(!grandparent.is_deleted());

            current.mark_deleted();
            current.unlock();

            grandparent.remove(gp_slot);
            self.reclaim
                .stage(current_offset, node::alloc_len(node::LEVEL_FANOUT));
            debug!(
                "thmap: collapsed interior node at offset={:#x}, staged for gc",
                current_offset
            );

            current = grandparent;
            current_offset = gp_offset;
        }
        current.unlock();

        let val = leaf.val();
        let owned_key_off = leaf.owned_key_offset();
        let key_len = leaf.key_len();
        if owned_key_off != 0 {
            self.reclaim.stage(owned_key_off, key_len);
        }
        self.reclaim.stage(leaf_off, leaf::alloc_len());
        Some(val)
    }

    /// Drain every region staged by `del` and hand it back to the
    /// allocator. The caller must ensure no reader could still observe any
    /// staged offset before calling this — the map performs no reclamation
    /// scheme of its own.
    pub fn gc(&self) {
        let ops = self.ops.as_ref();
        let freed = self.reclaim.drain(|offset, len| ops.free(offset, len));
        if freed > 0 {
            debug!("thmap: gc reclaimed {freed} staged region(s)");
        }
    }

    /// Number of regions currently staged for reclamation. Diagnostic only.
    pub fn staged_count(&self) -> usize {
        self.reclaim.staged_len()
    }
}

impl Drop for ThMap {
    fn drop(&mut self) {
        // Does not walk the tree: ownership of leaf key/value memory is the
        // caller's. Only the root allocation and our own bookkeeping are
        // freed here.
        self.ops.free(self.root_offset, node::alloc_len(node::ROOT_FANOUT));
    }
}

// SAFETY: all shared mutable state (node/leaf memory, the reclaim queue) is
// synchronized via the lock/CAS/fence discipline documented on each type;
// `ops`/`hash` are themselves required to be `Send + Sync`.
unsafe impl Send for ThMap {}
unsafe impl Sync for ThMap {}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_map() -> ThMap {
        ThMap::create(0, None, None, Flags::empty()).unwrap()
    }

    #[test]
    fn single_insert_and_lookup() {
        let map = new_map();
        assert_eq!(map.put(b"apple", 0x1), Some(0x1));
        assert_eq!(map.get(b"apple"), Some(0x1));
        assert_eq!(map.get(b"pear"), None);
    }

    #[test]
    fn duplicate_put_returns_existing_value() {
        let map = new_map();
        assert_eq!(map.put(b"k", 0xA), Some(0xA));
        assert_eq!(map.put(b"k", 0xB), Some(0xA));
        assert_eq!(map.get(b"k"), Some(0xA));
    }

    #[test]
    fn del_after_put_then_missing() {
        let map = new_map();
        map.put(b"k", 0x1);
        assert_eq!(map.del(b"k"), Some(0x1));
        assert_eq!(map.get(b"k"), None);
        assert_eq!(map.del(b"k"), None);
    }

    #[test]
    fn distinct_keys_do_not_clobber_each_other() {
        let map = new_map();
        for i in 0..256u32 {
            let key = i.to_be_bytes();
            assert_eq!(map.put(&key, i as usize), Some(i as usize));
        }
        for i in 0..256u32 {
            let key = i.to_be_bytes();
            assert_eq!(map.get(&key), Some(i as usize));
        }
    }

    #[test]
    fn gc_drains_staged_deletions() {
        let map = new_map();
        map.put(b"k", 0x1);
        map.del(b"k");
        assert!(map.staged_count() > 0);
        map.gc();
        assert_eq!(map.staged_count(), 0);
    }

    #[test]
    fn create_rejects_misaligned_base() {
        assert_eq!(
            ThMap::create(1, None, None, Flags::empty()).unwrap_err(),
            CreateError::MisalignedBase
        );
    }
}
