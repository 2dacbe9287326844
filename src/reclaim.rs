//! Deferred reclamation queue.
//!
//! Deletions stage freed regions here instead of handing them back to the
//! allocator immediately, because a concurrent reader may still be
//! traversing through a stale pointer to them. The caller is responsible for
//! establishing quiescence (e.g. via an epoch scheme, a global barrier, or
//! simply "no other thread is touching this map") before calling
//! [`crate::ThMap::gc`].
//!
//! The queue's own linked-list nodes are allocated via the process global
//! allocator (`Box`), not the injected [`crate::alloc::Allocator`] — this
//! bookkeeping is private to the map's owning process even when the map's
//! *data* lives in shared memory reachable through the injected allocator.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Entry {
    offset: usize,
    len: usize,
    next: *mut Entry,
}

/// Lock-free Treiber stack of staged `(offset, len)` regions.
pub struct ReclaimQueue {
    head: AtomicPtr<Entry>,
    len: AtomicUsize,
}

impl ReclaimQueue {
    pub fn new() -> Self {
        ReclaimQueue {
            head: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Stage a freed region for later reclamation.
    pub fn stage(&self, offset: usize, len: usize) {
        let node = Box::into_raw(Box::new(Entry {
            offset,
            len,
            next: std::ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Number of entries currently staged. For diagnostics/tests only; not
    /// part of the algorithm's contract.
    pub fn staged_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Swap the whole stack out for empty, then hand every staged
    /// `(offset, len)` pair to `free_one`. The caller must have already
    /// established quiescence for every entry being drained.
    pub fn drain(&self, mut free_one: impl FnMut(usize, usize)) -> usize {
        let mut node = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut count = 0;
        while !node.is_null() {
            // SAFETY: nodes are only ever linked in by `stage` and unlinked
            // here; once swapped out of `head` no other thread can reach them.
            let entry = unsafe { Box::from_raw(node) };
            free_one(entry.offset, entry.len);
            node = entry.next;
            count += 1;
        }
        self.len.fetch_sub(count, Ordering::Relaxed);
        count
    }
}

impl Default for ReclaimQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReclaimQueue {
    fn drop(&mut self) {
        // Any entries left staged at map-destruction time are leaked by
        // design (see `destroy`'s doc comment): we don't know their
        // allocator here, and the spec doesn't ask the destructor to walk
        // anything. We do still free our own bookkeeping nodes.
        let mut node = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        while !node.is_null() {
            let entry = unsafe { Box::from_raw(node) };
            node = entry.next;
        }
    }
}

// SAFETY: `Entry` pointers are only ever accessed through the Treiber stack
// protocol above; the queue itself owns them exclusively once staged.
unsafe impl Send for ReclaimQueue {}
unsafe impl Sync for ReclaimQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_visits_every_staged_entry_and_empties_the_queue() {
        let q = ReclaimQueue::new();
        q.stage(8, 16);
        q.stage(24, 32);
        assert_eq!(q.staged_len(), 2);

        let mut seen = Vec::new();
        let drained = q.drain(|off, len| seen.push((off, len)));
        assert_eq!(drained, 2);
        assert_eq!(q.staged_len(), 0);
        seen.sort();
        assert_eq!(seen, vec![(8, 16), (24, 32)]);
    }

    #[test]
    fn drain_on_empty_queue_is_a_noop() {
        let q = ReclaimQueue::new();
        let drained = q.drain(|_, _| panic!("should not be called"));
        assert_eq!(drained, 0);
    }
}
