// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Columnar arrays holding group-by key columns.

use crate::types::{DataType, DataTypeKind, DataValue, Date, F64};

mod data_chunk;
mod primitive_array;
mod serialize;
mod var_array;

pub use self::data_chunk::*;
pub use self::primitive_array::*;
pub use self::serialize::LEN_PREFIX_SIZE;
pub use self::var_array::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    #[error("failed to deserialize {kind:?} value: {reason}")]
    Deserialize {
        kind: DataTypeKind,
        reason: &'static str,
    },
    #[error("type mismatch: cannot push {value:?} into {array} builder")]
    TypeMismatch { value: DataValue, array: &'static str },
    #[error("invalid utf-8 in string key")]
    InvalidUtf8,
}

/// A trait over all array builders.
///
/// `ArrayBuilder` is a trait over all builders. You could build an array with
/// `push` with the help of `ArrayBuilder` trait. The `push` function always
/// accepts reference to an element. e.g. for `PrimitiveArray`,
/// you must do `builder.push(Some(&1))`. For `Utf8Array`, you must do
/// `builder.push(Some("xxx"))`. Note that you don't need to construct a `String`.
///
/// The associated type `Array` is the type of the corresponding array. It is the
/// return type of `finish`.
pub trait ArrayBuilder: Send + Sync + 'static {
    /// Corresponding `Array` of this builder
    type Array: Array<Builder = Self>;

    /// Create a new builder with `capacity`.
    fn with_capacity(capacity: usize) -> Self;

    /// Number of items pushed so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value to builder.
    fn push(&mut self, value: Option<&<Self::Array as Array>::Item>);

    /// Take all elements and return a new array.
    fn take(&mut self) -> Self::Array;

    /// Finish build and return a new array.
    fn finish(mut self) -> Self::Array
    where
        Self: Sized,
    {
        self.take()
    }
}

/// A trait over all array.
///
/// `Array` must be built with an `ArrayBuilder`. The array trait provides several
/// unified interface on an array, like `len` and `get`.
pub trait Array: Sized + Send + Sync + 'static {
    /// Corresponding builder of this array.
    type Builder: ArrayBuilder<Array = Self>;

    /// Type of element in the array.
    type Item: ?Sized;

    /// Returns true if the value at `idx` is null.
    fn is_null(&self, idx: usize) -> bool;

    /// Returns the raw value at `idx` regardless of null.
    fn get_raw(&self, idx: usize) -> &Self::Item;

    /// Retrieve a reference to value.
    fn get(&self, idx: usize) -> Option<&Self::Item> {
        if self.is_null(idx) {
            None
        } else {
            Some(self.get_raw(idx))
        }
    }

    /// Number of items of array.
    fn len(&self) -> usize;

    /// Returns true if any value is null.
    fn has_null(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type BoolArray = PrimitiveArray<bool>;
pub type I16Array = PrimitiveArray<i16>;
pub type I32Array = PrimitiveArray<i32>;
pub type I64Array = PrimitiveArray<i64>;
pub type F64Array = PrimitiveArray<F64>;
pub type DateArray = PrimitiveArray<Date>;

pub type BoolArrayBuilder = PrimitiveArrayBuilder<bool>;
pub type I16ArrayBuilder = PrimitiveArrayBuilder<i16>;
pub type I32ArrayBuilder = PrimitiveArrayBuilder<i32>;
pub type I64ArrayBuilder = PrimitiveArrayBuilder<i64>;
pub type F64ArrayBuilder = PrimitiveArrayBuilder<F64>;
pub type DateArrayBuilder = PrimitiveArrayBuilder<Date>;

/// A column whose every value is null, without any backing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NullArray {
    len: usize,
}

impl NullArray {
    pub const fn new(len: usize) -> Self {
        NullArray { len }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Embeds all possible array in `array` module.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayImpl {
    Null(NullArray),
    Bool(BoolArray),
    Int16(I16Array),
    Int32(I32Array),
    Int64(I64Array),
    Float64(F64Array),
    Date(DateArray),
    Utf8(Utf8Array),
    Blob(BlobArray),
}

/// Embeds all possible array builders in `array` module.
pub enum ArrayBuilderImpl {
    Bool(BoolArrayBuilder),
    Int16(I16ArrayBuilder),
    Int32(I32ArrayBuilder),
    Int64(I64ArrayBuilder),
    Float64(F64ArrayBuilder),
    Date(DateArrayBuilder),
    Utf8(Utf8ArrayBuilder),
    Blob(BlobArrayBuilder),
}

macro_rules! impl_into {
    ($x:ty, $y:ident) => {
        impl From<$x> for ArrayImpl {
            fn from(array: $x) -> Self {
                Self::$y(array)
            }
        }
    };
}

impl_into! { NullArray, Null }
impl_into! { BoolArray, Bool }
impl_into! { I16Array, Int16 }
impl_into! { I32Array, Int32 }
impl_into! { I64Array, Int64 }
impl_into! { F64Array, Float64 }
impl_into! { DateArray, Date }
impl_into! { Utf8Array, Utf8 }
impl_into! { BlobArray, Blob }

/// Dispatch a method call to the concrete array of every non-null variant.
macro_rules! dispatch_typed {
    ($self:expr, $a:ident => $body:expr, Null($n:ident) => $null:expr) => {
        match $self {
            ArrayImpl::Null($n) => $null,
            ArrayImpl::Bool($a) => $body,
            ArrayImpl::Int16($a) => $body,
            ArrayImpl::Int32($a) => $body,
            ArrayImpl::Int64($a) => $body,
            ArrayImpl::Float64($a) => $body,
            ArrayImpl::Date($a) => $body,
            ArrayImpl::Utf8($a) => $body,
            ArrayImpl::Blob($a) => $body,
        }
    };
}

impl ArrayImpl {
    /// Number of rows.
    pub fn len(&self) -> usize {
        dispatch_typed!(self, a => a.len(), Null(n) => n.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self, idx: usize) -> bool {
        dispatch_typed!(self, a => a.is_null(idx), Null(_n) => true)
    }

    /// Returns true if any value is null.
    pub fn has_null(&self) -> bool {
        dispatch_typed!(self, a => a.has_null(), Null(n) => !n.is_empty())
    }

    /// Returns true if this is the constant all-null column.
    pub fn only_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null(_) => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INT",
            Self::Int64(_) => "BIGINT",
            Self::Float64(_) => "DOUBLE",
            Self::Date(_) => "DATE",
            Self::Utf8(_) => "STRING",
            Self::Blob(_) => "BLOB",
        }
    }

    /// Kind of the values, `None` for the all-null column.
    pub fn kind(&self) -> Option<DataTypeKind> {
        Some(match self {
            Self::Null(_) => return None,
            Self::Bool(_) => DataTypeKind::Bool,
            Self::Int16(_) => DataTypeKind::Int16,
            Self::Int32(_) => DataTypeKind::Int32,
            Self::Int64(_) => DataTypeKind::Int64,
            Self::Float64(_) => DataTypeKind::Float64,
            Self::Date(_) => DataTypeKind::Date,
            Self::Utf8(_) => DataTypeKind::String,
            Self::Blob(_) => DataTypeKind::Blob,
        })
    }

    /// Get the value at the given index.
    pub fn get(&self, idx: usize) -> DataValue {
        match self {
            Self::Null(_) => DataValue::Null,
            Self::Bool(a) => a.get(idx).into(),
            Self::Int16(a) => a.get(idx).into(),
            Self::Int32(a) => a.get(idx).into(),
            Self::Int64(a) => a.get(idx).into(),
            Self::Float64(a) => a.get(idx).into(),
            Self::Date(a) => a.get(idx).into(),
            Self::Utf8(a) => a.get(idx).into(),
            Self::Blob(a) => a.get(idx).into(),
        }
    }

    /// Returns a byte-string view if this is a string or blob column.
    pub fn as_binary(&self) -> Option<BinaryColumn<'_>> {
        match self {
            Self::Utf8(a) => Some(a.as_binary()),
            Self::Blob(a) => Some(a.as_binary()),
            _ => None,
        }
    }
}

impl ArrayBuilderImpl {
    /// Create a new array builder from data type.
    pub fn new(ty: &DataType) -> Self {
        Self::with_capacity(0, ty)
    }

    /// Create a new array builder from data type and capacity.
    pub fn with_capacity(capacity: usize, ty: &DataType) -> Self {
        match ty.kind() {
            DataTypeKind::Bool => Self::Bool(BoolArrayBuilder::with_capacity(capacity)),
            DataTypeKind::Int16 => Self::Int16(I16ArrayBuilder::with_capacity(capacity)),
            DataTypeKind::Int32 => Self::Int32(I32ArrayBuilder::with_capacity(capacity)),
            DataTypeKind::Int64 => Self::Int64(I64ArrayBuilder::with_capacity(capacity)),
            DataTypeKind::Float64 => Self::Float64(F64ArrayBuilder::with_capacity(capacity)),
            DataTypeKind::Date => Self::Date(DateArrayBuilder::with_capacity(capacity)),
            DataTypeKind::String => Self::Utf8(Utf8ArrayBuilder::with_capacity(capacity)),
            DataTypeKind::Blob => Self::Blob(BlobArrayBuilder::with_capacity(capacity)),
        }
    }

    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "BOOLEAN",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INT",
            Self::Int64(_) => "BIGINT",
            Self::Float64(_) => "DOUBLE",
            Self::Date(_) => "DATE",
            Self::Utf8(_) => "STRING",
            Self::Blob(_) => "BLOB",
        }
    }

    pub fn kind(&self) -> DataTypeKind {
        match self {
            Self::Bool(_) => DataTypeKind::Bool,
            Self::Int16(_) => DataTypeKind::Int16,
            Self::Int32(_) => DataTypeKind::Int32,
            Self::Int64(_) => DataTypeKind::Int64,
            Self::Float64(_) => DataTypeKind::Float64,
            Self::Date(_) => DataTypeKind::Date,
            Self::Utf8(_) => DataTypeKind::String,
            Self::Blob(_) => DataTypeKind::Blob,
        }
    }

    /// Number of items pushed so far.
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(a) => a.len(),
            Self::Int16(a) => a.len(),
            Self::Int32(a) => a.len(),
            Self::Int64(a) => a.len(),
            Self::Float64(a) => a.len(),
            Self::Date(a) => a.len(),
            Self::Utf8(a) => a.len(),
            Self::Blob(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an element to the back of array.
    pub fn push(&mut self, v: &DataValue) -> Result<(), ArrayError> {
        match (self, v) {
            (Self::Bool(a), DataValue::Bool(v)) => a.push(Some(v)),
            (Self::Int16(a), DataValue::Int16(v)) => a.push(Some(v)),
            (Self::Int32(a), DataValue::Int32(v)) => a.push(Some(v)),
            (Self::Int64(a), DataValue::Int64(v)) => a.push(Some(v)),
            (Self::Float64(a), DataValue::Float64(v)) => a.push(Some(v)),
            (Self::Date(a), DataValue::Date(v)) => a.push(Some(v)),
            (Self::Utf8(a), DataValue::String(v)) => a.push(Some(v)),
            (Self::Blob(a), DataValue::Blob(v)) => a.push(Some(v)),
            (this, DataValue::Null) => this.push_null(),
            (this, value) => {
                return Err(ArrayError::TypeMismatch {
                    value: value.clone(),
                    array: this.type_name(),
                })
            }
        }
        Ok(())
    }

    /// Appends a null to the back of array.
    pub fn push_null(&mut self) {
        match self {
            Self::Bool(a) => a.push(None),
            Self::Int16(a) => a.push(None),
            Self::Int32(a) => a.push(None),
            Self::Int64(a) => a.push(None),
            Self::Float64(a) => a.push(None),
            Self::Date(a) => a.push(None),
            Self::Utf8(a) => a.push(None),
            Self::Blob(a) => a.push(None),
        }
    }

    /// Appends raw bytes to a string or blob builder.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), ArrayError> {
        match self {
            Self::Utf8(a) => {
                let s = std::str::from_utf8(bytes).map_err(|_| ArrayError::InvalidUtf8)?;
                a.push(Some(s));
            }
            Self::Blob(a) => a.push(Some(bytes)),
            this => {
                return Err(ArrayError::TypeMismatch {
                    value: DataValue::Blob(bytes.to_vec()),
                    array: this.type_name(),
                })
            }
        }
        Ok(())
    }

    /// Take all elements to a new array.
    pub fn take(&mut self) -> ArrayImpl {
        match self {
            Self::Bool(a) => ArrayImpl::Bool(a.take()),
            Self::Int16(a) => ArrayImpl::Int16(a.take()),
            Self::Int32(a) => ArrayImpl::Int32(a.take()),
            Self::Int64(a) => ArrayImpl::Int64(a.take()),
            Self::Float64(a) => ArrayImpl::Float64(a.take()),
            Self::Date(a) => ArrayImpl::Date(a.take()),
            Self::Utf8(a) => ArrayImpl::Utf8(a.take()),
            Self::Blob(a) => ArrayImpl::Blob(a.take()),
        }
    }

    /// Finish build and return a new array.
    pub fn finish(mut self) -> ArrayImpl {
        self.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataTypeExt;

    #[test]
    fn builder_roundtrip_values() {
        let values = [
            DataValue::Int32(1),
            DataValue::Null,
            DataValue::Int32(-7),
        ];
        let mut builder = ArrayBuilderImpl::new(&DataTypeKind::Int32.nullable());
        for v in &values {
            builder.push(v).unwrap();
        }
        let array = builder.finish();
        assert_eq!(array.len(), 3);
        assert!(array.has_null());
        assert!(!array.only_null());
        assert_eq!((0..3).map(|i| array.get(i)).collect::<Vec<_>>(), values);
    }

    #[test]
    fn push_type_mismatch() {
        let mut builder = ArrayBuilderImpl::new(&DataTypeKind::Int32.not_null());
        assert!(matches!(
            builder.push(&DataValue::String("a".into())),
            Err(ArrayError::TypeMismatch { .. })
        ));
        assert!(builder.push_bytes(b"a").is_err());
    }

    #[test]
    fn null_array() {
        let array = ArrayImpl::from(NullArray::new(3));
        assert!(array.only_null());
        assert!(array.has_null());
        assert!(array.is_null(2));
        assert_eq!(array.get(1), DataValue::Null);
    }
}
