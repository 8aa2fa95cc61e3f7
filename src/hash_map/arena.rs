// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use bumpalo::Bump;

/// Append-only storage of variable-length key bytes.
///
/// Bytes stay at their address until [`KeyArena::reset`], so a [`Slice`]
/// handed out by the arena stays valid as long as the arena is not reset
/// or dropped.
#[derive(Default)]
pub(crate) struct KeyArena {
    bump: Bump,
}

impl KeyArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes` into the arena.
    pub fn allocate(&self, bytes: &[u8]) -> Slice {
        self.allocate_with_reserve(bytes, 0)
    }

    /// Copies `bytes` into the arena, followed by `reserve` zeroed bytes.
    pub fn allocate_with_reserve(&self, bytes: &[u8], reserve: usize) -> Slice {
        let buf = self.bump.alloc_slice_fill_copy(bytes.len() + reserve, 0u8);
        buf[..bytes.len()].copy_from_slice(bytes);
        Slice {
            ptr: NonNull::from(buf).cast(),
            len: bytes.len(),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Frees all keys.
    ///
    /// Every [`Slice`] allocated before is dangling afterwards, so the table
    /// holding them must be cleared first.
    pub fn reset(&mut self) {
        self.bump.reset();
    }
}

/// A view of key bytes stored in a [`KeyArena`].
///
/// Slices are only created by the arena and only stored in tables owned
/// together with it.
#[derive(Clone, Copy)]
pub(crate) struct Slice {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a slice points into an arena owned by the same key map and moves with it.
unsafe impl Send for Slice {}

impl Slice {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the arena that allocated `ptr` outlives every table storing the slice.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Hash for Slice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl PartialEq for Slice {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Slice {}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Slice").field(&self.as_bytes()).finish()
    }
}
