// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Logical types of group-by key columns.

use serde::{Deserialize, Serialize};

mod date;
mod native;
mod value;

pub use self::date::*;
pub use self::native::*;
pub use self::value::*;

/// Kind of a column's values, without nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTypeKind {
    Bool,
    Int16,
    Int32,
    Int64,
    Float64,
    Date,
    String,
    Blob,
}

impl DataTypeKind {
    /// Width in bytes of one value, or `None` for variable-length kinds.
    pub const fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Int16 => Some(2),
            Self::Int32 | Self::Date => Some(4),
            Self::Int64 | Self::Float64 => Some(8),
            Self::String | Self::Blob => None,
        }
    }

    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::String | Self::Blob)
    }
}

/// Data type with nullable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    pub kind: DataTypeKind,
    pub nullable: bool,
}

impl DataType {
    pub const fn new(kind: DataTypeKind, nullable: bool) -> DataType {
        DataType { kind, nullable }
    }

    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub const fn kind(&self) -> DataTypeKind {
        self.kind
    }

    /// Worst-case width of one serialized value of this type, including the null flag.
    ///
    /// Returns `None` for variable-length kinds.
    pub const fn fixed_serialize_size(&self) -> Option<usize> {
        match self.kind.fixed_width() {
            Some(width) => Some(width + self.nullable as usize),
            None => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}

/// The extension methods for [`DataTypeKind`].
pub trait DataTypeExt {
    fn nullable(self) -> DataType;
    fn not_null(self) -> DataType;
}

impl DataTypeExt for DataTypeKind {
    fn nullable(self) -> DataType {
        DataType::new(self, true)
    }

    fn not_null(self) -> DataType {
        DataType::new(self, false)
    }
}
