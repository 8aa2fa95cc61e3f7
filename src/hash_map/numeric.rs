// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::hash::Hash;

use itertools::Itertools;

use super::table::AggHashTable;
use super::*;
use crate::array::{Array, ArrayBuilder, PrimitiveArray, PrimitiveArrayBuilder};
use crate::types::{canonical_f64_bits, DataType, DataTypeKind, Date, NativeType, F64};
use crate::Error;

/// A native type usable as a single group-by key.
///
/// Values are reinterpreted as an unsigned integer of the same width, so
/// that hashing and comparing keys never looks at the value's semantics.
pub trait NumericKeyType: NativeType + AsKeyRef {
    type Key: Copy + Eq + Hash + Send + 'static;

    const KIND: DataTypeKind;

    fn to_key(self) -> Self::Key;

    fn from_key(key: Self::Key) -> Self;

    fn downcast_array(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>>;

    fn downcast_builder(builder: &mut ArrayBuilderImpl) -> Option<&mut PrimitiveArrayBuilder<Self>>;
}

macro_rules! impl_numeric_key {
    ($t:ty, $key:ty, $variant:ident, |$v:ident| $to:expr, |$k:ident| $from:expr) => {
        impl NumericKeyType for $t {
            type Key = $key;

            const KIND: DataTypeKind = DataTypeKind::$variant;

            #[inline]
            fn to_key(self) -> $key {
                let $v = self;
                $to
            }

            #[inline]
            fn from_key($k: $key) -> Self {
                $from
            }

            fn downcast_array(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>> {
                match array {
                    ArrayImpl::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn downcast_builder(
                builder: &mut ArrayBuilderImpl,
            ) -> Option<&mut PrimitiveArrayBuilder<Self>> {
                match builder {
                    ArrayBuilderImpl::$variant(b) => Some(b),
                    _ => None,
                }
            }
        }
    };
}

impl_numeric_key!(bool, u8, Bool, |v| v as u8, |k| k != 0);
impl_numeric_key!(i16, u16, Int16, |v| v as u16, |k| k as i16);
impl_numeric_key!(i32, u32, Int32, |v| v as u32, |k| k as i32);
impl_numeric_key!(i64, u64, Int64, |v| v as u64, |k| k as i64);
impl_numeric_key!(Date, u32, Date, |v| v.get_inner() as u32, |k| Date::new(k as i32));
impl_numeric_key!(F64, u64, Float64, |v| canonical_f64_bits(v.0), |k| F64::from(f64::from_bits(k)));

/// Key map over a single fixed-width column.
pub struct NumericKeyMap<T: NumericKeyType> {
    hash_map: AggHashTable<T::Key>,
    is_nullable: bool,
    null_key_data: Option<AggDataPtr>,
    hash_values: Vec<u64>,
    chunk_size: usize,
}

impl<T: NumericKeyType> NumericKeyMap<T> {
    pub fn new(nullable: bool, chunk_size: usize) -> Self {
        Self {
            hash_map: AggHashTable::new(),
            is_nullable: nullable,
            null_key_data: None,
            hash_values: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    pub fn key_type(&self) -> DataType {
        DataType::new(T::KIND, self.is_nullable)
    }

    fn downcast<'a>(&self, column: &'a ArrayImpl) -> Result<&'a PrimitiveArray<T>> {
        T::downcast_array(column)
            .ok_or_else(|| Error::key_type_mismatch(0, &self.key_type(), column.type_name()))
    }

    fn compute_agg_states_non_nullable<F, Op>(
        &mut self,
        data: &[T],
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&T>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        if self.hash_map.should_prefetch() {
            self.compute_agg_prefetch::<F, Op>(data, allocate_func, agg_states, extra)
        } else {
            self.compute_agg_noprefetch::<F, Op>(data, allocate_func, agg_states, extra)
        }
    }

    fn compute_agg_noprefetch<F, Op>(
        &mut self,
        data: &[T],
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&T>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        for (i, value) in data.iter().enumerate() {
            let key = value.to_key();
            let hash = self.hash_map.hash_key(&key);
            self.hash_map.resolve::<Op>(
                i,
                hash,
                |k| *k == key,
                || Ok((key, allocate_func(Some(&T::from_key(key)))?)),
                agg_states,
                extra,
            )?;
        }
        Ok(())
    }

    fn compute_agg_prefetch<F, Op>(
        &mut self,
        data: &[T],
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&T>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let Self {
            hash_map,
            hash_values,
            ..
        } = self;
        hash_values.clear();
        hash_values.extend(data.iter().map(|v| hash_map.hash_key(&v.to_key())));

        for (i, value) in data.iter().enumerate() {
            if let Some(hash) = hash_values.get(i + PREFETCH_DISTANCE) {
                hash_map.prefetch_hash(*hash);
            }
            let key = value.to_key();
            hash_map.resolve::<Op>(
                i,
                hash_values[i],
                |k| *k == key,
                || Ok((key, allocate_func(Some(&T::from_key(key)))?)),
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
        F: FnMut(Option<&T>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        if column.only_null() {
            for i in 0..chunk_size {
                resolve_null_key::<T, F, Op>(
                    &mut self.null_key_data,
                    i,
                    allocate_func,
                    agg_states,
                    extra.not_founds,
                )?;
            }
            return Ok(());
        }
        let array = self.downcast(column)?;
        if !array.has_null() {
            return self.compute_agg_states_non_nullable::<F, Op>(
                &array.raw_data()[..chunk_size],
                allocate_func,
                agg_states,
                extra,
            );
        }
        self.compute_agg_through_null_data::<F, Op>(chunk_size, array, allocate_func, agg_states, extra)
    }

    fn compute_agg_through_null_data<F, Op>(
        &mut self,
        chunk_size: usize,
        array: &PrimitiveArray<T>,
        allocate_func: &mut F,
        agg_states: &mut [AggDataPtr],
        extra: &mut ExtraAggParam<'_>,
    ) -> Result<()>
    where
        F: FnMut(Option<&T>) -> Result<AggDataPtr>,
        Op: BuildOp,
    {
        let data = array.raw_data();
        for i in 0..chunk_size {
            if array.is_null(i) {
                resolve_null_key::<T, F, Op>(
                    &mut self.null_key_data,
                    i,
                    allocate_func,
                    agg_states,
                    extra.not_founds,
                )?;
                continue;
            }
            let key = data[i].to_key();
            let hash = self.hash_map.hash_key(&key);
            self.hash_map.resolve::<Op>(
                i,
                hash,
                |k| *k == key,
                || Ok((key, allocate_func(Some(&T::from_key(key)))?)),
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

impl<T: NumericKeyType> AggHashMap for NumericKeyMap<T> {
    type Key = T;

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
        if self.is_nullable {
            self.compute_agg_states_nullable::<F, Op>(chunk_size, column, allocate_func, agg_states, extra)
        } else {
            let array = self.downcast(column)?;
            debug_assert!(!array.has_null(), "null in a non-nullable key");
            self.compute_agg_states_non_nullable::<F, Op>(
                &array.raw_data()[..chunk_size],
                allocate_func,
                agg_states,
                extra,
            )
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
        self.hash_map.memory_usage() + self.hash_values.capacity() * std::mem::size_of::<u64>()
    }

    fn materialize(
        &self,
        columns: &mut [ArrayBuilderImpl],
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()> {
        check_key_builders(&[self.key_type()], columns)?;
        let actual = columns[0].type_name();
        let builder = T::downcast_builder(&mut columns[0])
            .ok_or_else(|| Error::key_type_mismatch(0, &self.key_type(), actual))?;

        agg_states.reserve(self.hash_map.len() + 1);
        let batch_size = self.chunk_size.max(1);
        let mut keys: Vec<T> = Vec::with_capacity(batch_size.min(self.hash_map.len()));
        for batch in &self.hash_map.iter().chunks(batch_size) {
            keys.clear();
            for (key, state) in batch {
                keys.push(T::from_key(*key));
                agg_states.push(*state);
            }
            for key in &keys {
                builder.push(Some(key));
            }
        }
        if let Some(state) = self.null_key_data {
            builder.push(None);
            agg_states.push(state);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.hash_map.clear();
        self.null_key_data = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;
    use crate::array::NullArray;
    use crate::hash_map::test_utils::{group_ids, StateAllocator};
    use crate::types::DataValue;

    fn int32_column(values: &[Option<i32>]) -> Vec<ArrayImpl> {
        vec![ArrayImpl::Int32(values.iter().copied().collect())]
    }

    #[test]
    fn groups_repeated_keys() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(false, 8);
        let columns = vec![ArrayImpl::Int32([5, 3, 5, 3, 7].into_iter().collect())];
        let mut states = vec![];
        map.build(5, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();

        assert_eq!(alloc.calls(), 3);
        assert_eq!(map.size(), 3);
        assert_eq!(states[0], states[2]);
        assert_eq!(states[1], states[3]);
        assert_ne!(states[4], states[0]);
        assert_ne!(states[4], states[1]);
        assert_ne!(states[0], states[1]);

        // the same keys in a later chunk resolve to the same states
        let columns = vec![ArrayImpl::Int32([7, 5].into_iter().collect())];
        let mut again = vec![];
        map.build(2, &columns, |k| alloc.try_allocate(k), &mut again).unwrap();
        assert_eq!(again, [states[4], states[0]]);
        assert_eq!(alloc.calls(), 3);
    }

    #[test]
    fn allocator_sees_native_keys() {
        let mut seen = vec![];
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i16>::new(false, 4);
        let columns = vec![ArrayImpl::Int16([-1, 2, -1].into_iter().collect())];
        map.build(
            3,
            &columns,
            |k: Option<&i16>| {
                seen.push(k.copied());
                alloc.try_allocate(k)
            },
            &mut vec![],
        )
        .unwrap();
        assert_eq!(seen, [Some(-1), Some(2)]);
    }

    #[test]
    fn null_group_is_allocated_once() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(true, 8);
        let mut states = vec![];
        for _ in 0..3 {
            let columns = int32_column(&[Some(1), None, Some(2), None]);
            map.build(4, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();
            assert_eq!(states[1], states[3]);
            assert_eq!(Some(states[1]), map.null_key_data());
        }
        let columns = vec![ArrayImpl::Null(NullArray::new(5))];
        map.build(5, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();
        assert!(states.iter().all(|s| Some(*s) == map.null_key_data()));

        assert_eq!(alloc.null_calls(), 1);
        assert_eq!(alloc.calls(), 3);
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn only_null_column_allocates_lazily() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i64>::new(true, 8);
        let columns = vec![ArrayImpl::Null(NullArray::new(3))];
        let mut states = vec![];
        let mut not_founds = vec![];
        map.build_with_selection(3, &columns, |k| alloc.try_allocate(k), &mut states, &mut not_founds)
            .unwrap();
        assert_eq!(not_founds, [1, 1, 1]);
        assert_eq!(alloc.calls(), 0);

        map.build(3, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();
        assert_eq!(alloc.null_calls(), 1);
    }

    #[test]
    fn nullable_without_nulls_takes_plain_path() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(true, 8);
        let columns = int32_column(&[Some(1), Some(1)]);
        let mut states = vec![];
        map.build(2, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();
        assert_eq!(states[0], states[1]);
        assert_eq!(map.null_key_data(), None);
    }

    #[test]
    fn selection_never_inserts() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(true, 8);
        let columns = int32_column(&[Some(1), None, Some(2)]);
        let mut states = vec![];
        let mut not_founds = vec![];
        map.build_with_selection(3, &columns, |k| alloc.try_allocate(k), &mut states, &mut not_founds)
            .unwrap();
        assert_eq!(not_founds, [1, 1, 1]);
        assert_eq!(map.size(), 0);
        assert_eq!(alloc.calls(), 0);

        let columns = int32_column(&[Some(2)]);
        map.build(1, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();
        let two = states[0];
        let columns = int32_column(&[Some(1), None, Some(2)]);
        map.build_with_selection(3, &columns, |k| alloc.try_allocate(k), &mut states, &mut not_founds)
            .unwrap();
        assert_eq!(not_founds, [1, 1, 0]);
        assert_eq!(states[2], two);
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn limit_bounds_population() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(false, 8);
        let columns = int32_column(&[Some(1), Some(2), Some(1), Some(3), Some(4), Some(2)]);
        let mut states = vec![];
        let mut not_founds = vec![];
        map.build_with_limit(6, &columns, |k| alloc.try_allocate(k), &mut states, &mut not_founds, 2)
            .unwrap();
        assert_eq!(map.size(), 2);
        assert_eq!(not_founds, [0, 0, 0, 1, 1, 0]);
        assert_eq!(states[0], states[2]);
        assert_eq!(states[1], states[5]);
    }

    #[test]
    fn selection_and_allocation_flags_new_keys() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(false, 8);
        let columns = int32_column(&[Some(1), Some(2), Some(1)]);
        let mut states = vec![];
        let mut not_founds = vec![];
        map.build_with_selection_and_allocation(
            3,
            &columns,
            |k| alloc.try_allocate(k),
            &mut states,
            &mut not_founds,
        )
        .unwrap();
        assert_eq!(not_founds, [1, 1, 0]);
        assert_eq!(map.size(), 2);
        assert_eq!(states[0], states[2]);
    }

    #[test]
    fn canonical_float_keys() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<F64>::new(false, 8);
        let values = [0.0, -0.0, f64::NAN, -f64::NAN, 1.5];
        let columns = vec![ArrayImpl::Float64(values.iter().map(|v| F64::from(*v)).collect())];
        let mut states = vec![];
        map.build(5, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();
        assert_eq!(states[0], states[1]);
        assert_eq!(states[2], states[3]);
        assert_eq!(map.size(), 3);
    }

    #[test]
    fn allocation_failure_propagates() {
        let alloc = StateAllocator::failing_after(2);
        let mut map = NumericKeyMap::<i32>::new(false, 8);
        let columns = int32_column(&[Some(1), Some(2), Some(1), Some(3), Some(4)]);
        let err = map
            .build(5, &columns, |k| alloc.try_allocate(k), &mut vec![])
            .unwrap_err();
        assert!(matches!(err, Error::AllocateState(_)));
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn wrong_column_type() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i64>::new(false, 8);
        let columns = int32_column(&[Some(1)]);
        let err = map
            .build(1, &columns, |k| alloc.try_allocate(k), &mut vec![])
            .unwrap_err();
        assert!(matches!(err, Error::KeyTypeMismatch { index: 0, .. }));
        let err = map
            .build(0, &[], |k| alloc.try_allocate(k), &mut vec![])
            .unwrap_err();
        assert!(matches!(err, Error::KeyColumnCount { expected: 1, actual: 0 }));
    }

    #[test_case(0; "always prefetch")]
    #[test_case(64; "prefetch after growth")]
    fn prefetch_parity(threshold: usize) {
        let values: Vec<Option<i32>> = (0..2000)
            .map(|i| if i % 11 == 0 { None } else { Some((i * 7919) % 300) })
            .collect();
        let chunks: Vec<_> = values.chunks(256).map(int32_column).collect();

        let run = |threshold: usize| {
            let alloc = StateAllocator::new();
            let mut map = NumericKeyMap::<i32>::new(true, 256);
            map.set_prefetch_threshold(threshold);
            let mut groups = vec![];
            let mut all_states = vec![];
            let mut not_founds = vec![];
            for (i, columns) in chunks.iter().enumerate() {
                let len = columns[0].len();
                let mut states = vec![];
                if i % 3 == 2 {
                    map.build_with_limit(len, columns, |k| alloc.try_allocate(k), &mut states, &mut not_founds, 200)
                        .unwrap();
                    groups.push(not_founds.clone());
                } else {
                    map.build(len, columns, |k| alloc.try_allocate(k), &mut states).unwrap();
                }
                all_states.extend(states);
            }
            (group_ids(&all_states), groups, map.size())
        };
        assert_eq!(run(threshold), run(usize::MAX));
    }

    #[test]
    fn materialize_keys() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<Date>::new(true, 8);
        let columns = vec![ArrayImpl::Date(
            [Some(Date::new(3)), None, Some(Date::new(1)), Some(Date::new(3))]
                .into_iter()
                .collect(),
        )];
        let mut states = vec![];
        map.build(4, &columns, |k| alloc.try_allocate(k), &mut states).unwrap();

        let mut builders = vec![ArrayBuilderImpl::new(&map.key_type())];
        let mut out_states = vec![];
        map.materialize(&mut builders, &mut out_states).unwrap();
        let keys = builders.pop().unwrap().finish();

        assert_eq!(keys.len(), 3);
        assert_eq!(keys.get(2), DataValue::Null);
        assert_eq!(out_states[2], states[1]);
        let mut values: Vec<_> = (0..2).map(|i| keys.get(i)).collect();
        values.sort();
        assert_eq!(values, [DataValue::Date(Date::new(1)), DataValue::Date(Date::new(3))]);
        for i in 0..2 {
            let row = if keys.get(i) == DataValue::Date(Date::new(3)) { 0 } else { 2 };
            assert_eq!(out_states[i], states[row]);
        }

        map.clear();
        assert_eq!(map.size(), 0);
        assert_eq!(map.null_key_data(), None);
    }

    #[test]
    fn materialize_in_batches() {
        let alloc = StateAllocator::new();
        let mut map = NumericKeyMap::<i32>::new(true, 4);
        let mut expected = HashMap::new();
        for round in 0..5 {
            let values: Vec<Option<i32>> = (0..4).map(|i| (i < 3).then_some(round * 3 + i)).collect();
            let mut states = vec![];
            map.build(4, &int32_column(&values), |k| alloc.try_allocate(k), &mut states)
                .unwrap();
            expected.extend(values.into_iter().zip(states));
        }
        assert_eq!(map.size(), 15);

        let mut builders = vec![ArrayBuilderImpl::new(&map.key_type())];
        let mut out_states = vec![];
        map.materialize(&mut builders, &mut out_states).unwrap();
        let keys = builders.pop().unwrap().finish();
        assert_eq!(keys.len(), 16);
        assert_eq!(keys.get(15), DataValue::Null);
        let materialized: HashMap<_, _> = (0..keys.len())
            .map(|i| match keys.get(i) {
                DataValue::Int32(v) => (Some(v), out_states[i]),
                _ => (None, out_states[i]),
            })
            .collect();
        assert_eq!(materialized, expected);
    }
}
