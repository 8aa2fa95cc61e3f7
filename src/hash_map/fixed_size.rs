// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use itertools::Itertools;
use smallvec::SmallVec;

use super::table::AggHashTable;
use super::*;

/// A serialized key stored inline in `N` bytes.
///
/// Unused trailing bytes are zero. If any key column is nullable the key may
/// be shorter than the fixed width, and the last byte holds its length.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> Default for SliceKey<N> {
    fn default() -> Self {
        Self { data: [0; N] }
    }
}

impl<const N: usize> SliceKey<N> {
    /// Bytes available to the serialized key.
    pub const fn capacity(nullable: bool) -> usize {
        if nullable {
            N - 1
        } else {
            N
        }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }
}

impl<const N: usize> std::fmt::Debug for SliceKey<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SliceKey").field(&&self.data[..]).finish()
    }
}

/// A key of the current batch and its hash.
#[derive(Clone, Copy, Default)]
struct KeyCache<const N: usize> {
    key: SliceKey<N>,
    hash: u64,
}

/// Key map over fixed-width key columns whose serialized rows fit in `N` bytes.
///
/// Keys are serialized straight into a per-batch cache and stored in the
/// table by value, so there is no key arena.
pub struct SerializedFixedSizeKeyMap<const N: usize> {
    key_types: SmallVec<[DataType; 4]>,
    has_null_column: bool,
    /// Serialized width of a row without nulls.
    fixed_byte_size: usize,
    hash_map: AggHashTable<SliceKey<N>>,
    caches: Vec<KeyCache<N>>,
    slice_sizes: Vec<u32>,
    chunk_size: usize,
}

impl<const N: usize> SerializedFixedSizeKeyMap<N> {
    /// Returns an error unless every key type is fixed width and a row fits in the key.
    pub fn new(key_types: &[DataType], chunk_size: usize) -> Result<Self> {
        if key_types.is_empty() {
            return Err(crate::Error::EmptyGroupByKeys);
        }
        let has_null_column = key_types.iter().any(|t| t.is_nullable());
        let fixed_byte_size = Self::fixed_byte_size(key_types)
            .filter(|size| *size <= SliceKey::<N>::capacity(has_null_column))
            .ok_or_else(|| crate::Error::unsupported_key_types(Self::NAME, key_types))?;
        Ok(Self {
            key_types: key_types.iter().copied().collect(),
            has_null_column,
            fixed_byte_size,
            hash_map: AggHashTable::new(),
            caches: vec![KeyCache::default(); chunk_size],
            slice_sizes: Vec::with_capacity(chunk_size),
            chunk_size,
        })
    }

    const NAME: &'static str = "fixed-size key map";

    /// Serialized width of a row, or `None` if a key type is variable length.
    pub fn fixed_byte_size(key_types: &[DataType]) -> Option<usize> {
        key_types.iter().map(|t| t.fixed_serialize_size()).sum()
    }

    /// Whether rows of `key_types` fit in this key.
    pub fn fits(key_types: &[DataType]) -> bool {
        let nullable = key_types.iter().any(|t| t.is_nullable());
        matches!(Self::fixed_byte_size(key_types), Some(size) if size <= SliceKey::<N>::capacity(nullable))
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    /// Serializes the first `chunk_size` rows into the caches.
    fn serialize_keys(&mut self, chunk_size: usize, key_columns: &[ArrayImpl]) {
        if self.caches.len() < chunk_size {
            self.caches.resize(chunk_size, KeyCache::default());
        }
        let caches = &mut self.caches[..chunk_size];
        if self.has_null_column {
            for cache in caches.iter_mut() {
                cache.key = SliceKey::default();
            }
        }
        self.slice_sizes.clear();
        self.slice_sizes.resize(chunk_size, 0);
        for (ty, column) in self.key_types.iter().zip(key_columns) {
            column.serialize_batch(
                ty.is_nullable(),
                caches.iter_mut().map(|c| &mut c.key.data[..]),
                &mut self.slice_sizes,
            );
        }
        if self.has_null_column {
            for (cache, size) in caches.iter_mut().zip(&self.slice_sizes) {
                cache.key.data[N - 1] = *size as u8;
            }
        }
    }

    /// Length of the serialized row held by `key`.
    #[inline]
    fn key_len(&self, key: &SliceKey<N>) -> usize {
        if self.has_null_column {
            key.data[N - 1] as usize
        } else {
            self.fixed_byte_size
        }
    }

    fn compute_agg_noprefetch<F, Op>(
        &mut self,
        chunk_size: usize,
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let Self {
            hash_map,
            caches,
            slice_sizes,
            ..
        } = self;
        for (i, (cache, size)) in caches[..chunk_size].iter().zip(slice_sizes.iter()).enumerate() {
            let key = cache.key;
            let hash = hash_map.hash_key(&key);
            hash_map.resolve::<Op>(
                i,
                hash,
                |k| *k == key,
                || Ok((key, allocate_func(Some(&key.data[..*size as usize]))?)),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    fn compute_agg_prefetch<F, Op>(
        &mut self,
        chunk_size: usize,
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let Self {
            hash_map,
            caches,
            slice_sizes,
            ..
        } = self;
        let caches = &mut caches[..chunk_size];
        for cache in caches.iter_mut() {
            cache.hash = hash_map.hash_key(&cache.key);
        }

        for (i, (cache, size)) in caches.iter().zip(slice_sizes.iter()).enumerate() {
            if let Some(ahead) = caches.get(i + PREFETCH_DISTANCE) {
                hash_map.prefetch_hash(ahead.hash);
            }
            let key = cache.key;
            hash_map.resolve::<Op>(
                i,
                cache.hash,
                |k| *k == key,
                || Ok((key, allocate_func(Some(&key.data[..*size as usize]))?)),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_prefetch_threshold(&mut self, threshold: usize) {
        self.hash_map.set_prefetch_threshold(threshold);
    }
}

impl<const N: usize> AggHashMap for SerializedFixedSizeKeyMap<N> {
    type Key = [u8];

    fn compute_agg_states<F, Op>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&Self::Key>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        check_key_columns(&self.key_types, key_columns)?;
        debug_assert!(key_columns.iter().all(|c| c.len() >= chunk_size));
        self.serialize_keys(chunk_size, key_columns);
        if self.hash_map.should_prefetch() {
            self.compute_agg_prefetch::<F, Op>(chunk_size, allocate_func, agg_states, extra)
        } else {
            self.compute_agg_noprefetch::<F, Op>(chunk_size, allocate_func, agg_states, extra)
        }
    }

    fn size(&self) -> usize {
        self.hash_map.len()
    }

    fn bucket_count(&self) -> usize {
        self.hash_map.bucket_count()
    }

    /// Always `None`. Null values are part of the serialized key.
    fn null_key_data(&self) -> Option<AggDataPtr> {
        None
    }

    fn memory_usage(&self) -> usize {
        self.hash_map.memory_usage()
            + self.caches.capacity() * std::mem::size_of::<KeyCache<N>>()
            + self.slice_sizes.capacity() * std::mem::size_of::<u32>()
    }

    fn materialize(
        &self,
        columns: &mut [ArrayBuilderImpl],
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()> {
        check_key_builders(&self.key_types, columns)?;
        agg_states.reserve(self.hash_map.len());

        let batch_size = self.chunk_size.max(1);
        let mut keys: Vec<&[u8]> = Vec::with_capacity(batch_size.min(self.hash_map.len()));
        for batch in &self.hash_map.iter().chunks(batch_size) {
            keys.clear();
            for (key, state) in batch {
                keys.push(&key.data[..self.key_len(key)]);
                agg_states.push(*state);
            }
            for (ty, builder) in self.key_types.iter().zip(columns.iter_mut()) {
                builder.deserialize_and_append_batch(ty.is_nullable(), &mut keys)?;
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.hash_map.clear();
    }
}
