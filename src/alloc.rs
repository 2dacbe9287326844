//! Injected allocator interface.
//!
//! The map never calls the global allocator directly for node, leaf or key
//! storage (the reclamation queue's own bookkeeping nodes are the one
//! exception — see `reclaim.rs`). Everything that becomes part of the trie
//! goes through an [`Allocator`] supplied at [`crate::ThMap::create`], so a
//! caller can back the whole structure with an arena carved out of shared
//! memory instead of the process heap.

/// Two-function allocator interface the map is parameterized over.
///
/// `alloc`/`free` exchange base-relative machine words, not raw pointers:
/// the map adds its `base` address before dereferencing, so a single
/// allocator implementation can serve maps mapped at different virtual
/// addresses in cooperating processes.
pub trait Allocator: Send + Sync {
    /// Allocate `len` bytes, returning a base-relative offset usable as a
    /// slot word. Returns `0` on failure. Implementations must return
    /// offsets aligned to at least 4 bytes (the tag discipline reserves the
    /// low two bits).
    fn alloc(&self, len: usize) -> usize;

    /// Free a region previously returned by `alloc`. `len` mirrors the
    /// `alloc` call; implementations that don't need it (plain `malloc`)
    /// may ignore it.
    fn free(&self, offset: usize, len: usize);
}

/// Default allocator: wraps the process global allocator. Only valid when
/// the map's `base` is `0`, since this implementation has no notion of a
/// caller-supplied arena and hands back absolute heap addresses as if they
/// were offsets from a zero base.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        // 8-byte alignment covers both AtomicU32/AtomicUsize node headers and
        // usize-sized leaf fields; it also satisfies the 4-byte minimum the
        // tag discipline requires.
        let layout = match std::alloc::Layout::from_size_align(len, 8) {
            Ok(l) => l,
            Err(_) => return 0,
        };
        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        ptr as usize
    }

    fn free(&self, offset: usize, len: usize) {
        if offset == 0 || len == 0 {
            return;
        }
        let layout = std::alloc::Layout::from_size_align(len, 8)
            .expect("free() called with a length that never came from alloc()");
        // SAFETY: offset was produced by `alloc` above with this same len and
        // base is 0, so offset is the original pointer.
        unsafe { std::alloc::dealloc(offset as *mut u8, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_alloc_free() {
        let a = SystemAllocator;
        let off = a.alloc(64);
        assert_ne!(off, 0);
        assert_eq!(off % 8, 0);
        a.free(off, 64);
    }

    #[test]
    fn zero_length_alloc_is_oom() {
        let a = SystemAllocator;
        assert_eq!(a.alloc(0), 0);
    }
}
