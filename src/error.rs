// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use crate::array::ArrayError;
use crate::types::DataType;

/// The error type of key map operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to allocate aggregate state: {0}")]
    AllocateState(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("expect {expected} key columns, but got {actual}")]
    KeyColumnCount { expected: usize, actual: usize },
    #[error("key column {index} should be {expected}, but got {actual}")]
    KeyTypeMismatch {
        index: usize,
        expected: String,
        actual: &'static str,
    },
    #[error("unsupported group-by key types for {map}: {types}")]
    UnsupportedKeyTypes { map: &'static str, types: String },
    #[error("group-by key list is empty")]
    EmptyGroupByKeys,
    #[error("corrupted key: {0}")]
    Array(#[from] ArrayError),
}

impl Error {
    /// Wraps an error raised by the aggregate state allocator.
    pub fn allocate_state(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::AllocateState(err.into())
    }

    pub(crate) fn key_type_mismatch(index: usize, expected: &DataType, actual: &'static str) -> Self {
        Self::KeyTypeMismatch {
            index,
            expected: expected.to_string(),
            actual,
        }
    }

    pub(crate) fn unsupported_key_types(map: &'static str, types: &[DataType]) -> Self {
        let types = types
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Self::UnsupportedKeyTypes { map, types }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
