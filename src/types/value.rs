// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use ordered_float::OrderedFloat;

use super::*;

/// Primitive SQL value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataValue {
    // NOTE: Null comes first.
    // => NULL is less than any non-NULL values
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(F64),
    Date(Date),
    String(String),
    Blob(Vec<u8>),
}

/// A wrapper around floats providing implementations of `Eq`, `Ord`, and `Hash`.
pub type F64 = OrderedFloat<f64>;

impl DataValue {
    /// Returns `true` if value is null.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the kind of value, `None` for null.
    pub fn kind(&self) -> Option<DataTypeKind> {
        Some(match self {
            Self::Null => return None,
            Self::Bool(_) => DataTypeKind::Bool,
            Self::Int16(_) => DataTypeKind::Int16,
            Self::Int32(_) => DataTypeKind::Int32,
            Self::Int64(_) => DataTypeKind::Int64,
            Self::Float64(_) => DataTypeKind::Float64,
            Self::Date(_) => DataTypeKind::Date,
            Self::String(_) => DataTypeKind::String,
            Self::Blob(_) => DataTypeKind::Blob,
        })
    }
}

macro_rules! impl_from_native {
    ($($Type:ty => $Value:ident),*) => {
        $(
            impl From<Option<&$Type>> for DataValue {
                fn from(v: Option<&$Type>) -> Self {
                    match v {
                        Some(v) => Self::$Value(*v),
                        None => Self::Null,
                    }
                }
            }
        )*
    };
}

impl_from_native!(bool => Bool, i16 => Int16, i32 => Int32, i64 => Int64, F64 => Float64, Date => Date);

impl From<Option<&str>> for DataValue {
    fn from(v: Option<&str>) -> Self {
        v.map_or(Self::Null, |s| Self::String(s.to_owned()))
    }
}

impl From<Option<&[u8]>> for DataValue {
    fn from(v: Option<&[u8]>) -> Self {
        v.map_or(Self::Null, |b| Self::Blob(b.to_vec()))
    }
}
