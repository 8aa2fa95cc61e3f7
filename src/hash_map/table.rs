// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::hash::Hash;

use ahash::RandomState;
use hashbrown::hash_table::{Entry, HashTable};

use super::{AggDataPtr, BuildMode, BuildOp, ExtraAggParam, PREFETCH_THRESHOLD};
use crate::Result;

/// A flat hash table from encoded keys to aggregate states.
///
/// Callers hash probe keys with [`AggHashTable::hash_key`] and pass the hash
/// to every probe, so a hash computed once for a batch is reused for the
/// lookup and the insertion.
pub(crate) struct AggHashTable<K> {
    table: HashTable<(K, AggDataPtr)>,
    hasher: RandomState,
    prefetch_threshold: usize,
}

impl<K: Hash> AggHashTable<K> {
    pub fn new() -> Self {
        Self {
            table: HashTable::new(),
            hasher: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
            prefetch_threshold: PREFETCH_THRESHOLD,
        }
    }

    /// Hashes a probe key. Must agree with the hash of the stored key it equals.
    #[inline]
    pub fn hash_key<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    pub fn find_with_hash(&self, hash: u64, mut eq: impl FnMut(&K) -> bool) -> Option<AggDataPtr> {
        self.table.find(hash, |(k, _)| eq(k)).map(|(_, state)| *state)
    }

    /// Returns the state of the key, calling `ctor` to build the entry only if it is absent.
    #[inline]
    pub fn lazy_emplace_with_hash(
        &mut self,
        hash: u64,
        mut eq: impl FnMut(&K) -> bool,
        ctor: impl FnOnce() -> Result<(K, AggDataPtr)>,
    ) -> Result<AggDataPtr> {
        let hasher = &self.hasher;
        match self
            .table
            .entry(hash, |(k, _)| eq(k), |(k, _)| hasher.hash_one(k))
        {
            Entry::Occupied(entry) => Ok(entry.get().1),
            Entry::Vacant(entry) => {
                let (key, state) = ctor()?;
                entry.insert((key, state));
                Ok(state)
            }
        }
    }

    /// Resolves one row under the build policy `Op`.
    ///
    /// On a hit the stored state is written to `agg_states[row]`. On a miss
    /// the key is inserted or the row is flagged, depending on the policy.
    #[inline]
    pub fn resolve<Op: BuildOp>(
        &mut self,
        row: usize,
        hash: u64,
        eq: impl FnMut(&K) -> bool,
        ctor: impl FnOnce() -> Result<(K, AggDataPtr)>,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()> {
        match Op::MODE {
            BuildMode::LookupOrInsert => {
                agg_states[row] = self.lazy_emplace_with_hash(hash, eq, ctor)?;
            }
            BuildMode::Lookup => self.find_or_flag(row, hash, eq, agg_states, extra.not_founds),
            BuildMode::LookupOrInsertBounded => {
                if self.len() < extra.limits {
                    agg_states[row] = self.lazy_emplace_with_hash(hash, eq, ctor)?;
                } else {
                    self.find_or_flag(row, hash, eq, agg_states, extra.not_founds);
                }
            }
            BuildMode::LookupOrInsertWithMissTracking => {
                let not_founds = &mut *extra.not_founds;
                agg_states[row] = self.lazy_emplace_with_hash(hash, eq, || {
                    let entry = ctor()?;
                    not_founds[row] = 1;
                    Ok(entry)
                })?;
            }
        }
        Ok(())
    }

    #[inline]
    fn find_or_flag(
        &self,
        row: usize,
        hash: u64,
        eq: impl FnMut(&K) -> bool,
        agg_states: &mut [AggDataPtr],
        not_founds: &mut [u8],
    ) {
        match self.find_with_hash(hash, eq) {
            Some(state) => agg_states[row] = state,
            None => not_founds[row] = 1,
        }
    }

    /// Hints that the bucket of `hash` will be probed soon.
    ///
    /// `HashTable` does not expose bucket addresses, so no bucket is touched
    /// here. What the prefetching loops do gain is that every hash of the batch
    /// is computed up front into a cache, in one tight pass over the keys, and
    /// that cached hash is reused for both the lookup and the insertion.
    #[inline(always)]
    pub fn prefetch_hash(&self, _hash: u64) {}

    /// Whether a batch should precompute hashes and prefetch.
    #[inline]
    pub fn should_prefetch(&self) -> bool {
        self.bucket_count() >= self.prefetch_threshold
    }

    #[cfg(test)]
    pub fn set_prefetch_threshold(&mut self, threshold: usize) {
        self.prefetch_threshold = threshold;
    }
}

impl<K> AggHashTable<K> {
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Number of buckets, derived from the capacity under hashbrown's 7/8 load factor.
    pub fn bucket_count(&self) -> usize {
        let capacity = self.table.capacity();
        if capacity == 0 {
            0
        } else if capacity < 8 {
            capacity + 1
        } else {
            capacity / 7 * 8
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(K, AggDataPtr)> + '_ {
        self.table.iter()
    }

    /// Bytes held by the buckets and their control bytes.
    pub fn memory_usage(&self) -> usize {
        let buckets = self.bucket_count();
        buckets * std::mem::size_of::<(K, AggDataPtr)>() + buckets
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}
