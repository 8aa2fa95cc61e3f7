// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Hash maps from group-by keys to aggregate states.
//!
//! A key map is created once per aggregation operator. Every chunk of input
//! is fed through one of the four build entry points of [`AggHashMap`], which
//! resolve each row's key to an [`AggDataPtr`] and write it to an output
//! vector aligned with the input rows. States are created by a caller-supplied
//! allocator the first time a key is seen.
//!
//! When the aggregation finishes, [`AggHashMap::materialize`] writes the
//! distinct keys back into columnar builders.

use std::ptr::NonNull;

use crate::array::{ArrayBuilderImpl, ArrayImpl};
use crate::types::DataType;
use crate::Result;

mod arena;
mod fixed_size;
mod numeric;
mod options;
mod serialized;
mod string;
mod table;
#[cfg(test)]
pub(crate) mod test_utils;
mod variant;

pub use self::fixed_size::{SerializedFixedSizeKeyMap, SliceKey};
pub use self::numeric::{NumericKeyMap, NumericKeyType};
pub use self::options::AggHashMapOptions;
pub use self::serialized::SerializedKeyMap;
pub use self::string::StringKeyMap;
pub use self::variant::{AggHashMapVariant, AsKeyRef, KeyRef};

/// Bucket count at and above which a batch precomputes hashes and prefetches.
pub const PREFETCH_THRESHOLD: usize = 8192;

/// Number of rows ahead whose bucket is prefetched.
pub const PREFETCH_DISTANCE: usize = 16;

/// Bytes reserved past the end of string keys and scratch buffers for wide reads.
pub const SLICE_OVERFLOW_PADDING: usize = 16;

/// Serialized keys longer than this are materialized row by row.
pub const ROW_WISE_DESERIALIZE_THRESHOLD: usize = 64;

/// Largest scratch buffer the column-wise serialization may use.
pub(crate) const SCRATCH_LIMIT: usize = i32::MAX as usize;

/// Opaque handle to an aggregate state allocated outside the key map.
///
/// The key map only stores and copies handles. It never dereferences or frees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggDataPtr(NonNull<u8>);

// SAFETY: the handle is never dereferenced by this crate.
unsafe impl Send for AggDataPtr {}
unsafe impl Sync for AggDataPtr {}

impl AggDataPtr {
    pub const fn new(ptr: NonNull<u8>) -> Self {
        AggDataPtr(ptr)
    }

    /// Returns `None` if `ptr` is null.
    pub fn from_ptr(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(AggDataPtr)
    }

    /// A placeholder for output slots that have not been resolved.
    pub const fn dangling() -> Self {
        AggDataPtr(NonNull::dangling())
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Per-row flags of a build call, `1` if the row's key was neither found nor inserted.
pub type Filter = Vec<u8>;

/// What a build call does with each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Insert missing keys.
    LookupOrInsert,
    /// Never mutate the table, flag missing keys.
    Lookup,
    /// Insert missing keys while the table is below the limit, flag the rest.
    LookupOrInsertBounded,
    /// Insert missing keys and flag them.
    LookupOrInsertWithMissTracking,
}

/// Compile-time policy of a build call.
pub trait BuildOp {
    /// Allocate a state and insert the key on a miss.
    const ALLOCATE: bool;
    /// Record misses in the not-found filter.
    const FILL_NOT_FOUND: bool;
    /// Only insert while the table population is below the limit.
    const PROCESS_LIMIT: bool;
    /// The mode the three flags select. Rows are resolved by this.
    const MODE: BuildMode;
}

pub struct HTBuildOp<const ALLOCATE: bool, const FILL_NOT_FOUND: bool, const PROCESS_LIMIT: bool>;

impl<const ALLOCATE: bool, const FILL_NOT_FOUND: bool, const PROCESS_LIMIT: bool> BuildOp
    for HTBuildOp<ALLOCATE, FILL_NOT_FOUND, PROCESS_LIMIT>
{
    const ALLOCATE: bool = ALLOCATE;
    const FILL_NOT_FOUND: bool = FILL_NOT_FOUND;
    const PROCESS_LIMIT: bool = PROCESS_LIMIT;
    const MODE: BuildMode = match (ALLOCATE, FILL_NOT_FOUND, PROCESS_LIMIT) {
        (true, false, false) => BuildMode::LookupOrInsert,
        (false, true, false) => BuildMode::Lookup,
        (false, true, true) => BuildMode::LookupOrInsertBounded,
        (true, true, false) => BuildMode::LookupOrInsertWithMissTracking,
        // Inserting without allocating, or bounding an allocating build, has no mode.
        _ => panic!("unsupported build operation"),
    };
}

pub type Build = HTBuildOp<true, false, false>;
pub type BuildWithSelection = HTBuildOp<false, true, false>;
pub type BuildWithLimit = HTBuildOp<false, true, true>;
pub type BuildWithSelectionAndAllocation = HTBuildOp<true, true, false>;

/// Outputs and bounds of a build call besides the states.
pub struct ExtraAggParam<'a> {
    /// Not-found filter, empty unless the policy fills it.
    pub not_founds: &'a mut [u8],
    /// Population bound of a limited build.
    pub limits: usize,
}

impl Default for ExtraAggParam<'_> {
    fn default() -> Self {
        ExtraAggParam {
            not_founds: &mut [],
            limits: 0,
        }
    }
}

/// A hash map from the group-by keys of a chunk to aggregate states.
///
/// The allocator is called with `Some(key)` for each new key and with `None`
/// for the group of null keys. It must not touch the key map.
pub trait AggHashMap {
    /// Key passed to the state allocator.
    type Key: ?Sized;

    /// Resolves the first `chunk_size` rows under the build policy `Op`.
    ///
    /// `agg_states` and, if the policy fills it, `extra.not_founds` must hold
    /// at least `chunk_size` entries.
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
        Op: BuildOp;

    /// Looks up every row and creates states for new keys.
    fn build<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()>
    where
        F: FnMut(Option<&Self::Key>) -> Result<AggDataPtr>,
    {
        prepare_states(chunk_size, agg_states);
        self.compute_agg_states::<F, Build>(
            chunk_size,
            key_columns,
            &mut allocate_func,
            agg_states,
            &mut ExtraAggParam::default(),
        )
    }

    /// Looks up every row without inserting. Rows with unknown keys are flagged in `not_founds`.
    fn build_with_selection<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
        not_founds: &mut Filter,
    ) -> Result<()>
    where
        F: FnMut(Option<&Self::Key>) -> Result<AggDataPtr>,
    {
        prepare_states(chunk_size, agg_states);
        prepare_not_founds(chunk_size, not_founds);
        self.compute_agg_states::<F, BuildWithSelection>(
            chunk_size,
            key_columns,
            &mut allocate_func,
            agg_states,
            &mut ExtraAggParam {
                not_founds: not_founds.as_mut_slice(),
                limits: 0,
            },
        )
    }

    /// Inserts new keys until the table holds `limit` keys, then flags further new keys.
    fn build_with_limit<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
        not_founds: &mut Filter,
        limit: usize,
    ) -> Result<()>
    where
        F: FnMut(Option<&Self::Key>) -> Result<AggDataPtr>,
    {
        prepare_states(chunk_size, agg_states);
        prepare_not_founds(chunk_size, not_founds);
        self.compute_agg_states::<F, BuildWithLimit>(
            chunk_size,
            key_columns,
            &mut allocate_func,
            agg_states,
            &mut ExtraAggParam {
                not_founds: not_founds.as_mut_slice(),
                limits: limit,
            },
        )
    }

    /// Creates states for new keys and flags the rows that created them.
    fn build_with_selection_and_allocation<F>(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayImpl],
        mut allocate_func: F,
        agg_states: &mut Vec<AggDataPtr>,
        not_founds: &mut Filter,
    ) -> Result<()>
    where
        F: FnMut(Option<&Self::Key>) -> Result<AggDataPtr>,
    {
        prepare_states(chunk_size, agg_states);
        prepare_not_founds(chunk_size, not_founds);
        self.compute_agg_states::<F, BuildWithSelectionAndAllocation>(
            chunk_size,
            key_columns,
            &mut allocate_func,
            agg_states,
            &mut ExtraAggParam {
                not_founds: not_founds.as_mut_slice(),
                limits: 0,
            },
        )
    }

    /// Number of keys in the table, not counting the null group.
    fn size(&self) -> usize;

    fn bucket_count(&self) -> usize;

    /// State of the null group, if one has been created.
    fn null_key_data(&self) -> Option<AggDataPtr>;

    /// Bytes held by the table, key arena and scratch buffers.
    fn memory_usage(&self) -> usize;

    /// Appends every distinct key to `columns` and its state to `agg_states`, in the same order.
    ///
    /// The null group, if any, comes last.
    fn materialize(
        &self,
        columns: &mut [ArrayBuilderImpl],
        agg_states: &mut Vec<AggDataPtr>,
    ) -> Result<()>;

    /// Drops all keys and the null group.
    fn clear(&mut self);
}

fn prepare_states(chunk_size: usize, agg_states: &mut Vec<AggDataPtr>) {
    agg_states.clear();
    agg_states.resize(chunk_size, AggDataPtr::dangling());
}

fn prepare_not_founds(chunk_size: usize, not_founds: &mut Filter) {
    not_founds.clear();
    not_founds.resize(chunk_size, 0);
}

/// Resolves a row whose key is null to the null group.
///
/// The null group is created at most once. A pure lookup never creates it.
#[inline]
pub(crate) fn resolve_null_key<K, F, Op>(
    null_key_data: &mut Option<AggDataPtr>,
    row: usize,
    allocate_func: &mut F,
    agg_states: &mut [AggDataPtr],
    not_founds: &mut [u8],
) -> Result<()>
where
    K: ?Sized,
    F: FnMut(Option<&K>) -> Result<AggDataPtr>,
    Op: BuildOp,
{
    match (*null_key_data, Op::MODE) {
        (Some(state), _) => agg_states[row] = state,
        (None, BuildMode::Lookup) => not_founds[row] = 1,
        (None, mode) => {
            let state = allocate_func(None)?;
            *null_key_data = Some(state);
            agg_states[row] = state;
            if mode == BuildMode::LookupOrInsertWithMissTracking {
                not_founds[row] = 1;
            }
        }
    }
    Ok(())
}

/// Checks the number of key columns.
pub(crate) fn check_key_column_count(expected: usize, key_columns: &[ArrayImpl]) -> Result<()> {
    if key_columns.len() != expected {
        return Err(crate::Error::KeyColumnCount {
            expected,
            actual: key_columns.len(),
        });
    }
    Ok(())
}

/// Checks that `columns` has one builder of the right kind per key type.
pub(crate) fn check_key_builders(key_types: &[DataType], columns: &[ArrayBuilderImpl]) -> Result<()> {
    if columns.len() != key_types.len() {
        return Err(crate::Error::KeyColumnCount {
            expected: key_types.len(),
            actual: columns.len(),
        });
    }
    for (index, (ty, builder)) in key_types.iter().zip(columns).enumerate() {
        if builder.kind() != ty.kind() {
            return Err(crate::Error::key_type_mismatch(index, ty, builder.type_name()));
        }
    }
    Ok(())
}

/// Checks that every key column has the kind of its key type.
///
/// A nullable key may also be fed the all-null column.
pub(crate) fn check_key_columns(key_types: &[DataType], key_columns: &[ArrayImpl]) -> Result<()> {
    check_key_column_count(key_types.len(), key_columns)?;
    for (index, (ty, column)) in key_types.iter().zip(key_columns).enumerate() {
        let compatible = match column.kind() {
            Some(kind) => kind == ty.kind(),
            None => ty.is_nullable(),
        };
        if !compatible {
            return Err(crate::Error::key_type_mismatch(index, ty, column.type_name()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_modes() {
        assert_eq!(Build::MODE, BuildMode::LookupOrInsert);
        assert_eq!(BuildWithSelection::MODE, BuildMode::Lookup);
        assert_eq!(BuildWithLimit::MODE, BuildMode::LookupOrInsertBounded);
        assert_eq!(
            BuildWithSelectionAndAllocation::MODE,
            BuildMode::LookupOrInsertWithMissTracking
        );
    }

    fn first_null_row<Op: BuildOp>() -> (bool, u8) {
        let mut null_key_data = None;
        let mut state = 0u8;
        let mut alloc = |_: Option<&u32>| Ok(AggDataPtr::from_ptr(&mut state).unwrap());
        let mut states = vec![AggDataPtr::dangling()];
        let mut not_founds = vec![0];
        resolve_null_key::<u32, _, Op>(&mut null_key_data, 0, &mut alloc, &mut states, &mut not_founds)
            .unwrap();
        (null_key_data.is_some(), not_founds[0])
    }

    #[test]
    fn null_key_per_mode() {
        assert_eq!(first_null_row::<Build>(), (true, 0));
        assert_eq!(first_null_row::<BuildWithSelection>(), (false, 1));
        assert_eq!(first_null_row::<BuildWithLimit>(), (true, 0));
        assert_eq!(first_null_row::<BuildWithSelectionAndAllocation>(), (true, 1));
    }

    #[test]
    fn agg_data_ptr() {
        assert!(AggDataPtr::from_ptr(std::ptr::null_mut()).is_none());
        let mut state = 0u8;
        let ptr = AggDataPtr::from_ptr(&mut state).unwrap();
        assert_eq!(ptr.as_ptr(), &mut state as *mut u8);
        assert_ne!(ptr, AggDataPtr::dangling());
    }

    #[test]
    fn null_key_is_allocated_once() {
        let mut null_key_data = None;
        let mut calls = 0;
        let mut state = 0u8;
        let mut alloc = |key: Option<&u32>| {
            assert!(key.is_none());
            calls += 1;
            Ok(AggDataPtr::from_ptr(&mut state).unwrap())
        };
        let mut states = vec![AggDataPtr::dangling(); 3];
        for row in 0..3 {
            resolve_null_key::<u32, _, Build>(&mut null_key_data, row, &mut alloc, &mut states, &mut [])
                .unwrap();
        }
        drop(alloc);
        assert_eq!(calls, 1);
        assert!(states.iter().all(|s| Some(*s) == null_key_data));
    }

    #[test]
    fn null_key_lookup_does_not_allocate() {
        let mut null_key_data = None;
        let mut alloc = |_: Option<&u32>| -> Result<AggDataPtr> { panic!("lookup must not allocate") };
        let mut states = vec![AggDataPtr::dangling(); 2];
        let mut not_founds = vec![0; 2];
        resolve_null_key::<u32, _, BuildWithSelection>(
            &mut null_key_data,
            1,
            &mut alloc,
            &mut states,
            &mut not_founds,
        )
        .unwrap();
        assert_eq!(not_founds, [0, 1]);
        assert!(null_key_data.is_none());
    }
}
