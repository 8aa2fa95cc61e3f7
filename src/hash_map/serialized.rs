// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::arena::{KeyArena, Slice};
use super::table::AggHashTable;
use super::*;

/// Key map over any set of key columns.
///
/// The values of a row are serialized into one byte string, which is the key
/// of the table. Nulls are part of the encoding, so there is no separate null
/// group.
///
/// A batch is serialized column by column into a scratch buffer holding one
/// fixed-stride slot per row. If the stride times the batch capacity would
/// exceed [`SCRATCH_LIMIT`], the batch is serialized and probed row by row
/// instead.
pub struct SerializedKeyMap {
    key_types: SmallVec<[DataType; 4]>,
    hash_map: AggHashTable<Slice>,
    arena: KeyArena,
    /// Serialized keys of the current batch.
    buffer: Vec<u8>,
    /// Length of each row's key in `buffer`.
    slice_sizes: Vec<u32>,
    caches: Vec<KeyCache>,
    /// Stride of `buffer`, the widest row it has been sized for. Zero until the
    /// first batch and after a fallback.
    max_one_row_size: usize,
    chunk_size: usize,
}

/// A serialized key of the current batch and its hash.
#[derive(Clone, Copy, Default)]
struct KeyCache {
    offset: usize,
    len: usize,
    hash: u64,
}

impl SerializedKeyMap {
    pub fn new(key_types: &[DataType], chunk_size: usize) -> Result<Self> {
        if key_types.is_empty() {
            return Err(crate::Error::EmptyGroupByKeys);
        }
        Ok(Self {
            key_types: key_types.iter().copied().collect(),
            hash_map: AggHashTable::new(),
            arena: KeyArena::new(),
            buffer: vec![],
            slice_sizes: Vec::with_capacity(chunk_size),
            caches: Vec::with_capacity(chunk_size),
            max_one_row_size: 0,
            chunk_size,
        })
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    /// Upper bound of the serialized width of any row of the batch.
    fn max_row_size(&self, key_columns: &[ArrayImpl]) -> usize {
        self.key_types
            .iter()
            .zip(key_columns)
            .map(|(ty, column)| column.max_one_element_serialize_size(ty.is_nullable()))
            .sum()
    }

    fn compute_agg_by_rows<F, Op>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let Self {
            key_types,
            hash_map,
            arena,
            buffer,
            ..
        } = self;
        for i in 0..chunk_size {
            let mut len = 0;
            for (ty, column) in key_types.iter().zip(key_columns) {
                len += column.serialize(i, ty.is_nullable(), &mut buffer[len..]);
            }
            let key = &buffer[..len];
            let hash = hash_map.hash_key(key);
            hash_map.resolve::<Op>(
                i,
                hash,
                |k| k.as_bytes() == key,
                || persist_key(arena, key, allocate_func),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    fn compute_agg_by_cols<F, Op>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let stride = self.max_one_row_size;
        self.slice_sizes.clear();
        self.slice_sizes.resize(chunk_size, 0);
        for (ty, column) in self.key_types.iter().zip(key_columns) {
            column.serialize_batch(
                ty.is_nullable(),
                self.buffer.chunks_mut(stride),
                &mut self.slice_sizes,
            );
        }

        if self.hash_map.should_prefetch() {
            self.compute_agg_prefetch::<F, Op>(stride, allocate_func, agg_states, extra)
        } else {
            self.compute_agg_noprefetch::<F, Op>(stride, allocate_func, agg_states, extra)
        }
    }

    fn compute_agg_noprefetch<F, Op>(
        &mut self,
        stride: usize,
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
            arena,
            buffer,
            slice_sizes,
            ..
        } = self;
        for (i, size) in slice_sizes.iter().enumerate() {
            let offset = i * stride;
            let key = &buffer[offset..offset + *size as usize];
            let hash = hash_map.hash_key(key);
            hash_map.resolve::<Op>(
                i,
                hash,
                |k| k.as_bytes() == key,
                || persist_key(arena, key, allocate_func),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    fn compute_agg_prefetch<F, Op>(
        &mut self,
        stride: usize,
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
            arena,
            buffer,
            slice_sizes,
            caches,
            ..
        } = self;
        caches.clear();
        caches.extend(slice_sizes.iter().enumerate().map(|(i, size)| {
            let offset = i * stride;
            let len = *size as usize;
            KeyCache {
                offset,
                len,
                hash: hash_map.hash_key(&buffer[offset..offset + len]),
            }
        }));

        for (i, cache) in caches.iter().enumerate() {
            if let Some(ahead) = caches.get(i + PREFETCH_DISTANCE) {
                hash_map.prefetch_hash(ahead.hash);
            }
            let key = &buffer[cache.offset..cache.offset + cache.len];
            hash_map.resolve::<Op>(
                i,
                cache.hash,
                |k| k.as_bytes() == key,
                || persist_key(arena, key, allocate_func),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    /// Appends the keys to `columns`, advancing each key past the decoded values.
    fn insert_keys_to_columns(&self, keys: &mut [&[u8]], columns: &mut [ArrayBuilderImpl]) -> Result<()> {
        let Some(first) = keys.first() else {
            return Ok(());
        };
        if first.len() > ROW_WISE_DESERIALIZE_THRESHOLD {
            for key in keys.iter_mut() {
                for (ty, builder) in self.key_types.iter().zip(columns.iter_mut()) {
                    let len = builder.deserialize_and_append(ty.is_nullable(), key)?;
                    *key = &key[len..];
                }
            }
        } else {
            for (ty, builder) in self.key_types.iter().zip(columns.iter_mut()) {
                builder.deserialize_and_append_batch(ty.is_nullable(), keys)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn scratch_len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub(crate) fn set_prefetch_threshold(&mut self, threshold: usize) {
        self.hash_map.set_prefetch_threshold(threshold);
    }
}

#[inline]
fn persist_key<F>(arena: &KeyArena, key: &[u8], allocate_func: &mut F) -> Result<(Slice, AggDataPtr)>
where
    F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
{
    let state = allocate_func(Some(key))?;
    Ok((arena.allocate(key), state))
}

impl AggHashMap for SerializedKeyMap {
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

        if chunk_size > self.chunk_size {
            trace!(from = self.chunk_size, to = chunk_size, "raise serialized key batch capacity");
            self.chunk_size = chunk_size;
            self.max_one_row_size = 0;
        }

        let cur_max = self.max_row_size(key_columns);
        if cur_max > self.max_one_row_size {
            let batch_bytes = cur_max
                .checked_mul(self.chunk_size)
                .and_then(|n| n.checked_add(SLICE_OVERFLOW_PADDING));
            match batch_bytes {
                Some(bytes) if bytes <= SCRATCH_LIMIT => {
                    trace!(row_size = cur_max, bytes, "grow serialized key scratch");
                    self.max_one_row_size = cur_max;
                    self.buffer.clear();
                    self.buffer.resize(bytes, 0);
                }
                _ => {
                    debug!(
                        row_size = cur_max,
                        chunk_size = self.chunk_size,
                        "serialized keys too wide for a batch, fall back to row-at-a-time"
                    );
                    self.max_one_row_size = 0;
                    self.buffer = vec![0; cur_max + SLICE_OVERFLOW_PADDING];
                    return self.compute_agg_by_rows::<F, Op>(
                        chunk_size,
                        key_columns,
                        allocate_func,
                        agg_states,
                        extra,
                    );
                }
            }
        }
        self.compute_agg_by_cols::<F, Op>(chunk_size, key_columns, allocate_func, agg_states, extra)
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
            + self.arena.allocated_bytes()
            + self.buffer.capacity()
            + self.slice_sizes.capacity() * std::mem::size_of::<u32>()
            + self.caches.capacity() * std::mem::size_of::<KeyCache>()
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
                keys.push(key.as_bytes());
                agg_states.push(*state);
            }
            self.insert_keys_to_columns(&mut keys, columns)?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.hash_map.clear();
        self.arena.reset();
    }
}
