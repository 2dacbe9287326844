//! A concurrent trie-hash map: an associative container keyed by arbitrary
//! byte strings, supporting lookup, insertion and deletion under
//! multi-reader / multi-writer concurrency with lock-free reads.
//!
//! The structure is address-space independent by construction: every
//! internal reference is a machine-word offset from a caller-supplied
//! `base`, so the same map can be mapped at different virtual addresses in
//! cooperating processes (e.g. when `base` anchors a shared-memory region
//! and a matching [`alloc::Allocator`] carves storage out of it). Run with
//! the defaults (`base = 0`, the process heap allocator), it behaves like
//! any other in-process concurrent map.
//!
//! Values are opaque `usize` words — this mirrors the `uintptr_t` value
//! slot of the thmap-style algorithm this crate implements, rather than
//! imposing a generic `V` the tree would need to know how to drop. Callers
//! storing richer data typically stash a `Box::into_raw(...) as usize` and
//! reconstitute it on removal.
//!
//! Deleting a key never frees its memory synchronously: interior nodes and
//! leaves retired by a delete are staged on a deferred reclamation queue and
//! only actually freed when the caller calls [`ThMap::gc`], at a point
//! where it has established that no reader can still be observing them.
//! This crate does not supply that quiescence scheme; it is an external
//! collaborator, same as the hash function and the allocator.

mod alloc;
mod error;
mod hash;
mod leaf;
mod map;
mod node;
mod reclaim;

pub use alloc::{Allocator, SystemAllocator};
pub use error::CreateError;
pub use hash::{HashFn, Murmur3Hash};
pub use map::{Flags, ThMap};
