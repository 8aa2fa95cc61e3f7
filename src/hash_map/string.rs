// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use itertools::Itertools;

use super::arena::{KeyArena, Slice};
use super::table::AggHashTable;
use super::*;
use crate::array::BinaryColumn;
use crate::Error;

/// Key map over a single string or blob column.
///
/// Probe keys are views into the input column. A key is copied into the
/// map's arena only when it is inserted.
pub struct StringKeyMap {
    hash_map: AggHashTable<Slice>,
    arena: KeyArena,
    key_type: DataType,
    null_key_data: Option<AggDataPtr>,
    hash_values: Vec<u64>,
    chunk_size: usize,
}

impl StringKeyMap {
    pub fn new(key_type: DataType, chunk_size: usize) -> Result<Self> {
        if !key_type.kind().is_binary() {
            return Err(Error::unsupported_key_types("string key map", &[key_type]));
        }
        Ok(Self {
            hash_map: AggHashTable::new(),
            arena: KeyArena::new(),
            key_type,
            null_key_data: None,
            hash_values: Vec::with_capacity(chunk_size),
            chunk_size,
        })
    }

    pub fn key_type(&self) -> DataType {
        self.key_type
    }

    fn binary_column<'a>(&self, column: &'a ArrayImpl) -> Result<BinaryColumn<'a>> {
        match column.as_binary() {
            Some(binary) if column.kind() == Some(self.key_type.kind()) => Ok(binary),
            _ => Err(Error::key_type_mismatch(0, &self.key_type, column.type_name())),
        }
    }

    fn compute_agg_states_non_nullable<F, Op>(
        &mut self,
        chunk_size: usize,
        column: BinaryColumn<'_>,
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        if self.hash_map.should_prefetch() {
            self.compute_agg_prefetch::<F, Op>(chunk_size, column, allocate_func, agg_states, extra)
        } else {
            self.compute_agg_noprefetch::<F, Op>(chunk_size, column, allocate_func, agg_states, extra)
        }
    }

    fn compute_agg_noprefetch<F, Op>(
        &mut self,
        chunk_size: usize,
        column: BinaryColumn<'_>,
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let Self { hash_map, arena, .. } = self;
        for i in 0..chunk_size {
            let key = column.get_slice(i);
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
        chunk_size: usize,
        column: BinaryColumn<'_>,
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
            hash_values,
            ..
        } = self;
        hash_values.clear();
        hash_values.extend((0..chunk_size).map(|i| hash_map.hash_key(column.get_slice(i))));

        for i in 0..chunk_size {
            if let Some(hash) = hash_values.get(i + PREFETCH_DISTANCE) {
                hash_map.prefetch_hash(*hash);
            }
            let key = column.get_slice(i);
            hash_map.resolve::<Op>(
                i,
                hash_values[i],
                |k| k.as_bytes() == key,
                || persist_key(arena, key, allocate_func),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    fn compute_agg_states_nullable<F, Op>(
        &mut self,
        chunk_size: usize,
        column: &ArrayImpl,
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        if column.only_null() {
            for i in 0..chunk_size {
                resolve_null_key::<[u8], F, Op>(
                    &mut self.null_key_data,
                    i,
                    allocate_func,
                    agg_states,
                    extra.not_founds,
                )?;
            }
            return Ok(());
        }
        let column = self.binary_column(column)?;
        if !column.has_null() {
            return self.compute_agg_states_non_nullable::<F, Op>(
                chunk_size,
                column,
                allocate_func,
                agg_states,
                extra,
            );
        }

        let Self {
            hash_map,
            arena,
            null_key_data,
            ..
        } = self;
        for i in 0..chunk_size {
            if column.is_null(i) {
                resolve_null_key::<[u8], F, Op>(
                    null_key_data,
                    i,
                    allocate_func,
                    agg_states,
                    extra.not_founds,
                )?;
                continue;
            }
            let key = column.get_slice(i);
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

    #[cfg(test)]
    pub(crate) fn set_prefetch_threshold(&mut self, threshold: usize) {
        self.hash_map.set_prefetch_threshold(threshold);
    }
}

/// Allocates the state of a new key and copies the key into the arena.
#[inline]
fn persist_key<F>(arena: &KeyArena, key: &[u8], allocate_func: &mut F) -> Result<(Slice, AggDataPtr)>
where
    F: FnMut(Option<&[u8]>) -> Result<AggDataPtr>,
{
    let state = allocate_func(Some(key))?;
    Ok((arena.allocate_with_reserve(key, SLICE_OVERFLOW_PADDING), state))
}

impl AggHashMap for StringKeyMap {
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
        check_key_column_count(1, key_columns)?;
        let column = &key_columns[0];
        debug_assert!(column.len() >= chunk_size);
        if self.key_type.is_nullable() {
            self.compute_agg_states_nullable::<F, Op>(chunk_size, column, allocate_func, agg_states, extra)
        } else {
            let column = self.binary_column(column)?;
            debug_assert!(!column.has_null(), "null in a non-nullable key");
            self.compute_agg_states_non_nullable::<F, Op>(chunk_size, column, allocate_func, agg_states, extra)
        }
    }

    fn size(&self) -> usize {
        self.hash_map.len()
    }

    fn bucket_count(&self) -> usize {
        self.hash_map.bucket_count()
    }

    fn null_key_data(&self) -> Option<AggDataPtr> {
        self.null_key_data
    }

    fn memory_usage(&self) -> usize {
        self.hash_map.memory_usage()
            + self.arena.allocated_bytes()
            + self.hash_values.capacity() * std::mem::size_of::<u64>()
    }

    fn materialize(
        &self,
        columns: &mut [ArrayBuilderImpl],
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()> {
        check_key_builders(&[self.key_type], columns)?;
        let builder = &mut columns[0];

        agg_states.reserve(self.hash_map.len() + 1);
        let batch_size = self.chunk_size.max(1);
        let mut keys: Vec<&[u8]> = Vec::with_capacity(batch_size.min(self.hash_map.len()));
        for batch in &self.hash_map.iter().chunks(batch_size) {
            keys.clear();
            for (key, state) in batch {
                keys.push(key.as_bytes());
                agg_states.push(*state);
            }
            for key in &keys {
                builder.push_bytes(key)?;
            }
        }
        if let Some(state) = self.null_key_data {
            builder.push_null();
            agg_states.push(state);
        }
        Ok(())
    }

    fn clear(&mut self) {
        // the table holds slices into the arena
        self.hash_map.clear();
        self.arena.reset();
        self.null_key_data = None;
    }
}
