// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use smallvec::{smallvec, SmallVec};
use tracing::debug;

use super::*;
use crate::types::{DataTypeKind, Date, F64};

/// A key as seen by the state allocator of [`AggHashMapVariant`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyRef<'a> {
    /// The group of null keys.
    Null,
    /// Booleans, integers and dates.
    Int(i64),
    Float(f64),
    /// String and blob values, or a serialized multi-column key.
    Bytes(&'a [u8]),
}

/// Conversion of a map key to a [`KeyRef`].
pub trait AsKeyRef {
    fn as_key_ref(&self) -> KeyRef<'_>;
}

macro_rules! impl_int_key_ref {
    ($($t:ty),*) => {
        $(impl AsKeyRef for $t {
            fn as_key_ref(&self) -> KeyRef<'_> {
                KeyRef::Int(*self as i64)
            }
        })*
    };
}

impl_int_key_ref!(bool, i16, i32, i64);

impl AsKeyRef for Date {
    fn as_key_ref(&self) -> KeyRef<'_> {
        KeyRef::Int(self.get_inner() as i64)
    }
}

impl AsKeyRef for F64 {
    fn as_key_ref(&self) -> KeyRef<'_> {
        KeyRef::Float(self.0)
    }
}

impl AsKeyRef for [u8] {
    fn as_key_ref(&self) -> KeyRef<'_> {
        KeyRef::Bytes(self)
    }
}

#[inline]
fn key_ref<K: AsKeyRef + ?Sized>(key: Option<&K>) -> KeyRef<'_> {
    key.map_or(KeyRef::Null, AsKeyRef::as_key_ref)
}

/// One of the key maps, chosen by the group-by key types.
pub enum AggHashMapVariant {
    Bool(NumericKeyMap<bool>),
    Int16(NumericKeyMap<i16>),
    Int32(NumericKeyMap<i32>),
    Int64(NumericKeyMap<i64>),
    Float64(NumericKeyMap<F64>),
    Date(NumericKeyMap<Date>),
    String(StringKeyMap),
    FixedSize4(SerializedFixedSizeKeyMap<4>),
    FixedSize8(SerializedFixedSizeKeyMap<8>),
    FixedSize16(SerializedFixedSizeKeyMap<16>),
    Serialized(SerializedKeyMap),
}

macro_rules! for_all_maps {
    ($self:expr, $map:ident => $body:expr) => {
        match $self {
            AggHashMapVariant::Bool($map) => $body,
            AggHashMapVariant::Int16($map) => $body,
            AggHashMapVariant::Int32($map) => $body,
            AggHashMapVariant::Int64($map) => $body,
            AggHashMapVariant::Float64($map) => $body,
            AggHashMapVariant::Date($map) => $body,
            AggHashMapVariant::String($map) => $body,
            AggHashMapVariant::FixedSize4($map) => $body,
            AggHashMapVariant::FixedSize8($map) => $body,
            AggHashMapVariant::FixedSize16($map) => $body,
            AggHashMapVariant::Serialized($map) => $body,
        }
    };
}

impl AggHashMapVariant {
    /// Picks the key map for `key_types`.
    ///
    /// A single fixed-width key gets a numeric map and a single string or blob
    /// key gets a string map. Several keys are serialized, inline into the
    /// narrowest fixed-size key that holds them if possible.
    pub fn new(options: &AggHashMapOptions, key_types: &[DataType]) -> Result<Self> {
        let chunk_size = options.chunk_size;
        let map = match key_types {
            [] => return Err(crate::Error::EmptyGroupByKeys),
            [ty] => {
                let nullable = ty.is_nullable();
                match ty.kind() {
                    DataTypeKind::Bool => Self::Bool(NumericKeyMap::new(nullable, chunk_size)),
                    DataTypeKind::Int16 => Self::Int16(NumericKeyMap::new(nullable, chunk_size)),
                    DataTypeKind::Int32 => Self::Int32(NumericKeyMap::new(nullable, chunk_size)),
                    DataTypeKind::Int64 => Self::Int64(NumericKeyMap::new(nullable, chunk_size)),
                    DataTypeKind::Float64 => Self::Float64(NumericKeyMap::new(nullable, chunk_size)),
                    DataTypeKind::Date => Self::Date(NumericKeyMap::new(nullable, chunk_size)),
                    DataTypeKind::String | DataTypeKind::Blob => {
                        Self::String(StringKeyMap::new(*ty, chunk_size)?)
                    }
                }
            }
            _ if options.enable_fixed_size_keys && SerializedFixedSizeKeyMap::<4>::fits(key_types) => {
                Self::FixedSize4(SerializedFixedSizeKeyMap::new(key_types, chunk_size)?)
            }
            _ if options.enable_fixed_size_keys && SerializedFixedSizeKeyMap::<8>::fits(key_types) => {
                Self::FixedSize8(SerializedFixedSizeKeyMap::new(key_types, chunk_size)?)
            }
            _ if options.enable_fixed_size_keys && SerializedFixedSizeKeyMap::<16>::fits(key_types) => {
                Self::FixedSize16(SerializedFixedSizeKeyMap::new(key_types, chunk_size)?)
            }
            _ => Self::Serialized(SerializedKeyMap::new(key_types, chunk_size)?),
        };
        debug!(map = map.name(), keys = key_types.len(), chunk_size, "select aggregation key map");
        Ok(map)
    }

    /// Name of the selected map, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Date(_) => "date",
            Self::String(_) => "string",
            Self::FixedSize4(_) => "fixed_size_4",
            Self::FixedSize8(_) => "fixed_size_8",
            Self::FixedSize16(_) => "fixed_size_16",
            Self::Serialized(_) => "serialized",
        }
    }

    /// Types of the key columns, in order.
    pub fn key_types(&self) -> SmallVec<[DataType; 4]> {
        match self {
            Self::Bool(m) => smallvec![m.key_type()],
            Self::Int16(m) => smallvec![m.key_type()],
            Self::Int32(m) => smallvec![m.key_type()],
            Self::Int64(m) => smallvec![m.key_type()],
            Self::Float64(m) => smallvec![m.key_type()],
            Self::Date(m) => smallvec![m.key_type()],
            Self::String(m) => smallvec![m.key_type()],
            Self::FixedSize4(m) => m.key_types().into(),
            Self::FixedSize8(m) => m.key_types().into(),
            Self::FixedSize16(m) => m.key_types().into(),
            Self::Serialized(m) => m.key_types().into(),
        }
    }

    /// Looks up every row and creates states for new keys.
    pub fn build<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()>
    where
        F: FnMut(KeyRef<'_>) -> Result<AggDataPtr>,
    {
        for_all_maps!(self, map => map.build(
            chunk_size,
            key_columns,
            |key| allocate_func(key_ref(key)),
            agg_states,
        ))
    }

    /// Looks up every row without inserting. Rows with unknown keys are flagged in `not_founds`.
    pub fn build_with_selection<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
        not_founds: &mut Filter,
    ) -> Result<()>
    where
        F: FnMut(KeyRef<'_>) -> Result<AggDataPtr>,
    {
        for_all_maps!(self, map => map.build_with_selection(
            chunk_size,
            key_columns,
            |key| allocate_func(key_ref(key)),
            agg_states,
            not_founds,
        ))
    }

    /// Inserts new keys until the table holds `limit` keys, then flags further new keys.
    pub fn build_with_limit<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
        not_founds: &mut Filter,
        limit: usize,
    ) -> Result<()>
    where
        F: FnMut(KeyRef<'_>) -> Result<AggDataPtr>,
    {
        for_all_maps!(self, map => map.build_with_limit(
            chunk_size,
            key_columns,
            |key| allocate_func(key_ref(key)),
            agg_states,
            not_founds,
            limit,
        ))
    }

    /// Creates states for new keys and flags the rows that created them.
    pub fn build_with_selection_and_allocation<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
        not_founds: &mut Filter,
    ) -> Result<()>
    where
        F: FnMut(KeyRef<'_>) -> Result<AggDataPtr>,
    {
        for_all_maps!(self, map => map.build_with_selection_and_allocation(
            chunk_size,
            key_columns,
            |key| allocate_func(key_ref(key)),
            agg_states,
            not_founds,
        ))
    }

    pub fn size(&self) -> usize {
        for_all_maps!(self, map => map.size())
    }

    pub fn bucket_count(&self) -> usize {
        for_all_maps!(self, map => map.bucket_count())
    }

    pub fn null_key_data(&self) -> Option<AggDataPtr> {
        for_all_maps!(self, map => map.null_key_data())
    }

    pub fn memory_usage(&self) -> usize {
        for_all_maps!(self, map => map.memory_usage())
    }

    /// Appends every distinct key to `columns` and its state to `agg_states`.
    pub fn materialize(
        &self,
        columns: &mut [ArrayBuilderImpl],
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()> {
        for_all_maps!(self, map => map.materialize(columns, agg_states))
    }

    pub fn clear(&mut self) {
        for_all_maps!(self, map => map.clear())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::array::{DataChunk, Utf8Array};
    use crate::hash_map::test_utils::StateAllocator;
    use crate::types::{DataTypeExt, DataValue};
    use crate::Error;

    fn options(enable_fixed_size_keys: bool) -> AggHashMapOptions {
        AggHashMapOptions {
            enable_fixed_size_keys,
            ..AggHashMapOptions::default_for_test()
        }
    }

    #[test_case(&[DataTypeKind::Bool.nullable()], true, "bool")]
    #[test_case(&[DataTypeKind::Int16.not_null()], true, "int16")]
    #[test_case(&[DataTypeKind::Int32.nullable()], true, "int32")]
    #[test_case(&[DataTypeKind::Int64.not_null()], true, "int64")]
    #[test_case(&[DataTypeKind::Float64.nullable()], true, "float64")]
    #[test_case(&[DataTypeKind::Date.not_null()], true, "date")]
    #[test_case(&[DataTypeKind::String.nullable()], true, "string")]
    #[test_case(&[DataTypeKind::Blob.not_null()], true, "string")]
    #[test_case(&[DataTypeKind::Int16.not_null(), DataTypeKind::Int16.not_null()], true, "fixed_size_4")]
    #[test_case(&[DataTypeKind::Int16.nullable(), DataTypeKind::Int16.not_null()], true, "fixed_size_8")]
    #[test_case(&[DataTypeKind::Int32.not_null(), DataTypeKind::Int32.not_null()], true, "fixed_size_8")]
    #[test_case(&[DataTypeKind::Int64.nullable(), DataTypeKind::Int32.nullable()], true, "fixed_size_16")]
    #[test_case(&[DataTypeKind::Int64.nullable(), DataTypeKind::Int64.nullable()], true, "serialized")]
    #[test_case(&[DataTypeKind::Int32.not_null(), DataTypeKind::String.not_null()], true, "serialized")]
    #[test_case(&[DataTypeKind::Int16.not_null(), DataTypeKind::Int16.not_null()], false, "serialized")]
    fn select_map(key_types: &[DataType], enable_fixed_size_keys: bool, expected: &str) {
        let map = AggHashMapVariant::new(&options(enable_fixed_size_keys), key_types).unwrap();
        assert_eq!(map.name(), expected);
        assert_eq!(map.key_types().as_slice(), key_types);
    }

    #[test]
    fn no_keys() {
        assert!(matches!(
            AggHashMapVariant::new(&options(true), &[]),
            Err(Error::EmptyGroupByKeys)
        ));
    }

    #[test]
    fn allocator_sees_key_refs() {
        let alloc = StateAllocator::new();
        let mut seen = vec![];
        let mut record = |key: KeyRef<'_>| {
            seen.push(format!("{key:?}"));
            alloc.try_allocate::<()>(None)
        };

        let mut map = AggHashMapVariant::new(&options(true), &[DataTypeKind::Float64.nullable()]).unwrap();
        let columns = vec![ArrayImpl::Float64([Some(F64::from(1.5)), None].into_iter().collect())];
        map.build(2, &columns, &mut record, &mut vec![]).unwrap();

        let mut map = AggHashMapVariant::new(&options(true), &[DataTypeKind::Date.not_null()]).unwrap();
        let columns = vec![ArrayImpl::Date([Date::new(-3)].into_iter().collect())];
        map.build(1, &columns, &mut record, &mut vec![]).unwrap();

        let mut map = AggHashMapVariant::new(&options(true), &[DataTypeKind::String.not_null()]).unwrap();
        let columns = vec![ArrayImpl::Utf8([Some("k")].into_iter().collect::<Utf8Array>())];
        map.build(1, &columns, &mut record, &mut vec![]).unwrap();

        assert_eq!(seen, ["Float(1.5)", "Null", "Int(-3)", "Bytes([107])"]);
    }

    #[test_case(true; "fixed size keys")]
    #[test_case(false; "serialized keys")]
    fn multi_column_round_trip(enable_fixed_size_keys: bool) {
        let alloc = StateAllocator::new();
        let key_types = [DataTypeKind::Int32.nullable(), DataTypeKind::Bool.not_null()];
        let mut map = AggHashMapVariant::new(&options(enable_fixed_size_keys), &key_types).unwrap();
        let chunk: DataChunk = [
            ArrayImpl::Int32([Some(1), None, Some(1), None].into_iter().collect()),
            ArrayImpl::Bool([true, false, true, true].into_iter().collect()),
        ]
        .into_iter()
        .collect();

        let mut states = vec![];
        map.build(
            chunk.cardinality(),
            chunk.arrays(),
            |_| alloc.try_allocate::<()>(Some(&())),
            &mut states,
        )
        .unwrap();
        assert_eq!(map.size(), 3);
        assert_eq!(states[0], states[2]);
        assert_eq!(map.null_key_data(), None);

        let mut builders: Vec<_> = map.key_types().iter().map(ArrayBuilderImpl::new).collect();
        let mut out_states = vec![];
        map.materialize(&mut builders, &mut out_states).unwrap();
        let arrays: Vec<_> = builders.into_iter().map(|b| b.finish()).collect();
        let mut rows: Vec<_> = (0..3)
            .map(|i| (arrays[0].get(i), arrays[1].get(i), out_states[i]))
            .collect();
        rows.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        assert_eq!(
            rows,
            [
                (DataValue::Null, DataValue::Bool(false), states[1]),
                (DataValue::Null, DataValue::Bool(true), states[3]),
                (DataValue::Int32(1), DataValue::Bool(true), states[0]),
            ]
        );

        assert!(map.memory_usage() > 0);
        assert!(map.bucket_count() >= map.size());
        map.clear();
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn tracking_modes_through_variant() {
        let alloc = StateAllocator::new();
        let mut map = AggHashMapVariant::new(&options(true), &[DataTypeKind::Int64.nullable()]).unwrap();
        let columns = vec![ArrayImpl::Int64([Some(1), None, Some(2)].into_iter().collect())];
        let mut states = vec![];
        let mut not_founds = vec![];

        map.build_with_selection(3, &columns, |_| alloc.try_allocate::<()>(None), &mut states, &mut not_founds)
            .unwrap();
        assert_eq!(not_founds, [1, 1, 1]);

        map.build_with_selection_and_allocation(
            3,
            &columns,
            |_| alloc.try_allocate::<()>(None),
            &mut states,
            &mut not_founds,
        )
        .unwrap();
        assert_eq!(not_founds, [1, 1, 1]);
        assert!(map.null_key_data().is_some());

        let columns = vec![ArrayImpl::Int64([Some(3), Some(2), Some(4)].into_iter().collect())];
        map.build_with_limit(3, &columns, |_| alloc.try_allocate::<()>(None), &mut states, &mut not_founds, 3)
            .unwrap();
        assert_eq!(not_founds, [0, 0, 1]);
        assert_eq!(map.size(), 3);
    }
}
