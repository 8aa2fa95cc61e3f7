// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;

use bumpalo::Bump;

use super::AggDataPtr;
use crate::{Error, Result};

/// Allocates distinct dummy states and counts the calls.
pub(crate) struct StateAllocator {
    arena: Bump,
    calls: Cell<usize>,
    null_calls: Cell<usize>,
    fail_after: Option<usize>,
}

impl StateAllocator {
    pub fn new() -> Self {
        Self {
            arena: Bump::new(),
            calls: Cell::new(0),
            null_calls: Cell::new(0),
            fail_after: None,
        }
    }

    /// An allocator that returns an error once `n` states have been allocated.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new()
        }
    }

    pub fn allocate(&self) -> AggDataPtr {
        self.calls.set(self.calls.get() + 1);
        let state = self.arena.alloc(self.calls.get() as u64);
        AggDataPtr::new(NonNull::from(state).cast())
    }

    /// Allocator callback for any key map.
    pub fn try_allocate<K: ?Sized>(&self, key: Option<&K>) -> Result<AggDataPtr> {
        if self.fail_after == Some(self.calls.get()) {
            return Err(Error::allocate_state("state memory exhausted"));
        }
        if key.is_none() {
            self.null_calls.set(self.null_calls.get() + 1);
        }
        Ok(self.allocate())
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn null_calls(&self) -> usize {
        self.null_calls.get()
    }
}

/// Numbers each distinct state by its first appearance, so that outputs of
/// maps fed by different allocators can be compared.
pub(crate) fn group_ids(states: &[AggDataPtr]) -> Vec<usize> {
    let mut ids = HashMap::new();
    states
        .iter()
        .map(|state| {
            let next = ids.len();
            *ids.entry(*state).or_insert(next)
        })
        .collect()
}
