// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Row-wise serialization of key columns.
//!
//! Every element is written little endian. A nullable column prefixes each
//! element with a flag byte: `1` means null and nothing follows, `0` means a
//! value follows. Fixed-width values are written as their raw bytes, strings
//! and blobs as a `u32` length followed by the bytes.

use super::*;
use crate::types::{canonical_f64_bits, NativeType};

/// Size of the length prefix of a string or blob element.
pub const LEN_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

const NULL_FLAG: u8 = 1;
const NOT_NULL_FLAG: u8 = 0;

/// Fixed-width little endian encoding of a native value.
trait FixedCodec: NativeType {
    const KIND: DataTypeKind;
    const WIDTH: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

macro_rules! impl_int_codec {
    ($($t:ty => $kind:ident),*) => {
        $(
            impl FixedCodec for $t {
                const KIND: DataTypeKind = DataTypeKind::$kind;
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn encode(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(&self.to_le_bytes());
                }

                fn decode(buf: &[u8]) -> Self {
                    let mut raw = [0; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(buf);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_int_codec!(i16 => Int16, i32 => Int32, i64 => Int64);

impl FixedCodec for bool {
    const KIND: DataTypeKind = DataTypeKind::Bool;
    const WIDTH: usize = 1;

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = *self as u8;
    }

    fn decode(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

impl FixedCodec for F64 {
    const KIND: DataTypeKind = DataTypeKind::Float64;
    const WIDTH: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&canonical_f64_bits(self.0).to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut raw = [0; 8];
        raw.copy_from_slice(buf);
        F64::from(f64::from_bits(u64::from_le_bytes(raw)))
    }
}

impl FixedCodec for Date {
    const KIND: DataTypeKind = DataTypeKind::Date;
    const WIDTH: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        self.get_inner().encode(buf);
    }

    fn decode(buf: &[u8]) -> Self {
        Date::new(i32::decode(buf))
    }
}

/// Writes the null flag if the column is nullable.
///
/// Returns the number of bytes written and whether the element is null.
#[inline]
fn write_null_flag(nullable: bool, is_null: bool, buf: &mut [u8]) -> (usize, bool) {
    if !nullable {
        return (0, false);
    }
    if is_null {
        buf[0] = NULL_FLAG;
        (1, true)
    } else {
        buf[0] = NOT_NULL_FLAG;
        (1, false)
    }
}

#[inline]
fn serialize_primitive<T: FixedCodec>(
    array: &PrimitiveArray<T>,
    idx: usize,
    nullable: bool,
    buf: &mut [u8],
) -> usize {
    debug_assert!(nullable || !array.is_null(idx), "null in a non-nullable key");
    let (pos, is_null) = write_null_flag(nullable, array.is_null(idx), buf);
    if is_null {
        return pos;
    }
    array.get_raw(idx).encode(&mut buf[pos..pos + T::WIDTH]);
    pos + T::WIDTH
}

#[inline]
fn serialize_binary(column: BinaryColumn<'_>, idx: usize, nullable: bool, buf: &mut [u8]) -> usize {
    debug_assert!(nullable || !column.is_null(idx), "null in a non-nullable key");
    let (mut pos, is_null) = write_null_flag(nullable, column.is_null(idx), buf);
    if is_null {
        return pos;
    }
    let bytes = column.get_slice(idx);
    buf[pos..pos + LEN_PREFIX_SIZE].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    pos += LEN_PREFIX_SIZE;
    buf[pos..pos + bytes.len()].copy_from_slice(bytes);
    pos + bytes.len()
}

#[inline]
fn serialize_null(nullable: bool, buf: &mut [u8]) -> usize {
    debug_assert!(nullable, "null column in a non-nullable key");
    buf[0] = NULL_FLAG;
    1
}

fn serialize_batch_with<'b>(
    rows: impl IntoIterator<Item = &'b mut [u8]>,
    slice_sizes: &mut [u32],
    mut f: impl FnMut(usize, &mut [u8]) -> usize,
) {
    for (idx, (row, size)) in rows.into_iter().zip(slice_sizes.iter_mut()).enumerate() {
        let offset = *size as usize;
        *size += f(idx, &mut row[offset..]) as u32;
    }
}

impl ArrayImpl {
    /// Upper bound of the serialized size of any one element of this column.
    pub fn max_one_element_serialize_size(&self, nullable: bool) -> usize {
        let flag = nullable as usize;
        match self {
            Self::Null(_) => 1,
            Self::Bool(_) => flag + bool::WIDTH,
            Self::Int16(_) => flag + i16::WIDTH,
            Self::Int32(_) => flag + i32::WIDTH,
            Self::Int64(_) => flag + i64::WIDTH,
            Self::Float64(_) => flag + F64::WIDTH,
            Self::Date(_) => flag + Date::WIDTH,
            Self::Utf8(a) => flag + LEN_PREFIX_SIZE + a.as_binary().max_len(),
            Self::Blob(a) => flag + LEN_PREFIX_SIZE + a.as_binary().max_len(),
        }
    }

    /// Serializes the element at `idx` to the front of `buf`, returning the bytes written.
    ///
    /// `buf` must hold at least [`max_one_element_serialize_size`](Self::max_one_element_serialize_size) bytes.
    pub fn serialize(&self, idx: usize, nullable: bool, buf: &mut [u8]) -> usize {
        match self {
            Self::Null(_) => serialize_null(nullable, buf),
            Self::Bool(a) => serialize_primitive(a, idx, nullable, buf),
            Self::Int16(a) => serialize_primitive(a, idx, nullable, buf),
            Self::Int32(a) => serialize_primitive(a, idx, nullable, buf),
            Self::Int64(a) => serialize_primitive(a, idx, nullable, buf),
            Self::Float64(a) => serialize_primitive(a, idx, nullable, buf),
            Self::Date(a) => serialize_primitive(a, idx, nullable, buf),
            Self::Utf8(a) => serialize_binary(a.as_binary(), idx, nullable, buf),
            Self::Blob(a) => serialize_binary(a.as_binary(), idx, nullable, buf),
        }
    }

    /// Appends element `i` to `rows[i]` at offset `slice_sizes[i]`, advancing the offset.
    pub fn serialize_batch<'b>(
        &self,
        nullable: bool,
        rows: impl IntoIterator<Item = &'b mut [u8]>,
        slice_sizes: &mut [u32],
    ) {
        debug_assert!(slice_sizes.len() <= self.len());
        match self {
            Self::Null(_) => {
                serialize_batch_with(rows, slice_sizes, |_, buf| serialize_null(nullable, buf))
            }
            Self::Bool(a) => {
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_primitive(a, i, nullable, buf))
            }
            Self::Int16(a) => {
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_primitive(a, i, nullable, buf))
            }
            Self::Int32(a) => {
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_primitive(a, i, nullable, buf))
            }
            Self::Int64(a) => {
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_primitive(a, i, nullable, buf))
            }
            Self::Float64(a) => {
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_primitive(a, i, nullable, buf))
            }
            Self::Date(a) => {
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_primitive(a, i, nullable, buf))
            }
            Self::Utf8(a) => {
                let column = a.as_binary();
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_binary(column, i, nullable, buf))
            }
            Self::Blob(a) => {
                let column = a.as_binary();
                serialize_batch_with(rows, slice_sizes, |i, buf| serialize_binary(column, i, nullable, buf))
            }
        }
    }
}

/// Reads the null flag if the column is nullable.
///
/// Returns the number of bytes consumed and whether the element is null.
#[inline]
fn read_null_flag(kind: DataTypeKind, nullable: bool, bytes: &[u8]) -> Result<(usize, bool), ArrayError> {
    if !nullable {
        return Ok((0, false));
    }
    match bytes.first() {
        Some(&NULL_FLAG) => Ok((1, true)),
        Some(&NOT_NULL_FLAG) => Ok((1, false)),
        Some(_) => Err(ArrayError::Deserialize {
            kind,
            reason: "invalid null flag",
        }),
        None => Err(ArrayError::Deserialize {
            kind,
            reason: "unexpected end of key",
        }),
    }
}

fn deserialize_primitive<T: FixedCodec>(
    builder: &mut PrimitiveArrayBuilder<T>,
    nullable: bool,
    bytes: &[u8],
) -> Result<usize, ArrayError> {
    let (pos, is_null) = read_null_flag(T::KIND, nullable, bytes)?;
    if is_null {
        builder.push(None);
        return Ok(pos);
    }
    let raw = bytes
        .get(pos..pos + T::WIDTH)
        .ok_or(ArrayError::Deserialize {
            kind: T::KIND,
            reason: "unexpected end of key",
        })?;
    builder.push(Some(&T::decode(raw)));
    Ok(pos + T::WIDTH)
}

/// Reads one string or blob element, returning `None` for null.
fn read_binary(kind: DataTypeKind, nullable: bool, bytes: &[u8]) -> Result<(Option<&[u8]>, usize), ArrayError> {
    let truncated = ArrayError::Deserialize {
        kind,
        reason: "unexpected end of key",
    };
    let (mut pos, is_null) = read_null_flag(kind, nullable, bytes)?;
    if is_null {
        return Ok((None, pos));
    }
    let prefix = bytes.get(pos..pos + LEN_PREFIX_SIZE).ok_or_else(|| truncated.clone())?;
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    pos += LEN_PREFIX_SIZE;
    let value = bytes.get(pos..pos + len).ok_or(truncated)?;
    Ok((Some(value), pos + len))
}

impl ArrayBuilderImpl {
    /// Decodes one element from the front of `bytes` and appends it, returning the bytes consumed.
    pub fn deserialize_and_append(&mut self, nullable: bool, bytes: &[u8]) -> Result<usize, ArrayError> {
        match self {
            Self::Bool(b) => deserialize_primitive(b, nullable, bytes),
            Self::Int16(b) => deserialize_primitive(b, nullable, bytes),
            Self::Int32(b) => deserialize_primitive(b, nullable, bytes),
            Self::Int64(b) => deserialize_primitive(b, nullable, bytes),
            Self::Float64(b) => deserialize_primitive(b, nullable, bytes),
            Self::Date(b) => deserialize_primitive(b, nullable, bytes),
            Self::Utf8(b) => {
                let (value, len) = read_binary(DataTypeKind::String, nullable, bytes)?;
                let value = value
                    .map(std::str::from_utf8)
                    .transpose()
                    .map_err(|_| ArrayError::InvalidUtf8)?;
                b.push(value);
                Ok(len)
            }
            Self::Blob(b) => {
                let (value, len) = read_binary(DataTypeKind::Blob, nullable, bytes)?;
                b.push(value);
                Ok(len)
            }
        }
    }

    /// Decodes one element from the front of every key, advancing each key past it.
    pub fn deserialize_and_append_batch(&mut self, nullable: bool, keys: &mut [&[u8]]) -> Result<(), ArrayError> {
        for key in keys.iter_mut() {
            let len = self.deserialize_and_append(nullable, key)?;
            *key = &key[len..];
        }
        Ok(())
    }
}
