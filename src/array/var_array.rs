// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::marker::PhantomData;
use std::mem;

use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;

use super::{Array, ArrayBuilder};

/// A collection of variable-length values.
#[derive(Debug, PartialEq, Eq)]
pub struct BytesArray<T: ValueRef + ?Sized> {
    offset: Box<[usize]>,
    valid: BitVec,
    data: Box<[u8]>,
    _type: PhantomData<T>,
}

/// The borrowed type of a variable-length value.
pub trait ValueRef: AsRef<[u8]> + Send + Sync + 'static {
    fn from_bytes(s: &[u8]) -> &Self;
}

impl ValueRef for str {
    fn from_bytes(s: &[u8]) -> &Self {
        // SAFETY: the builder only accepts `&str`, so every stored slice is valid utf-8.
        unsafe { std::str::from_utf8_unchecked(s) }
    }
}

impl ValueRef for [u8] {
    fn from_bytes(s: &[u8]) -> &Self {
        s
    }
}

pub type Utf8Array = BytesArray<str>;
pub type BlobArray = BytesArray<[u8]>;
pub type Utf8ArrayBuilder = BytesArrayBuilder<str>;
pub type BlobArrayBuilder = BytesArrayBuilder<[u8]>;

impl<T: ValueRef + ?Sized> Clone for BytesArray<T> {
    fn clone(&self) -> Self {
        Self {
            offset: self.offset.clone(),
            valid: self.valid.clone(),
            data: self.data.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: ValueRef + ?Sized> Array for BytesArray<T> {
    type Item = T;
    type Builder = BytesArrayBuilder<T>;

    fn is_null(&self, idx: usize) -> bool {
        !self.valid[idx]
    }

    fn get_raw(&self, idx: usize) -> &T {
        T::from_bytes(&self.data[self.offset[idx]..self.offset[idx + 1]])
    }

    fn len(&self) -> usize {
        self.valid.len()
    }

    fn has_null(&self) -> bool {
        self.valid.not_all()
    }
}

impl<T: ValueRef + ?Sized> BytesArray<T> {
    /// Returns a borrowed byte-level view of this column.
    pub fn as_binary(&self) -> BinaryColumn<'_> {
        BinaryColumn {
            offset: &self.offset,
            valid: &self.valid,
            data: &self.data,
        }
    }
}

/// A borrowed view over a string or blob column, exposing each row as raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct BinaryColumn<'a> {
    offset: &'a [usize],
    valid: &'a BitSlice,
    data: &'a [u8],
}

impl<'a> BinaryColumn<'a> {
    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    /// Bytes of row `idx`. Empty for a null row.
    pub fn get_slice(&self, idx: usize) -> &'a [u8] {
        &self.data[self.offset[idx]..self.offset[idx + 1]]
    }

    pub fn is_null(&self, idx: usize) -> bool {
        !self.valid[idx]
    }

    pub fn has_null(&self) -> bool {
        self.valid.not_all()
    }

    /// Length of the longest value.
    pub fn max_len(&self) -> usize {
        self.offset
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0)
    }
}

/// A builder that uses `&T` to build an [`BytesArray`].
pub struct BytesArrayBuilder<T: ValueRef + ?Sized> {
    offset: Vec<usize>,
    valid: BitVec,
    data: Vec<u8>,
    _type: PhantomData<T>,
}

impl<T: ValueRef + ?Sized> ArrayBuilder for BytesArrayBuilder<T> {
    type Array = BytesArray<T>;

    fn with_capacity(capacity: usize) -> Self {
        let mut offset = Vec::with_capacity(capacity + 1);
        offset.push(0);
        Self {
            offset,
            data: Vec::with_capacity(capacity),
            valid: BitVec::with_capacity(capacity),
            _type: PhantomData,
        }
    }

    fn len(&self) -> usize {
        self.valid.len()
    }

    fn push(&mut self, value: Option<&T>) {
        self.valid.push(value.is_some());
        if let Some(x) = value {
            self.data.extend_from_slice(x.as_ref());
        }
        self.offset.push(self.data.len());
    }

    fn take(&mut self) -> BytesArray<T> {
        BytesArray {
            valid: mem::take(&mut self.valid),
            data: mem::take(&mut self.data).into(),
            offset: mem::replace(&mut self.offset, vec![0]).into(),
            _type: PhantomData,
        }
    }
}

// Enable `collect()` an array from iterator of `Option<&T>` or `Option<T::Owned>`.
impl<O: AsRef<T>, T: ValueRef + ?Sized> FromIterator<Option<O>> for BytesArray<T> {
    fn from_iter<I: IntoIterator<Item = Option<O>>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut builder = <Self as Array>::Builder::with_capacity(iter.size_hint().0);
        for e in iter {
            if let Some(s) = e {
                builder.push(Some(s.as_ref()));
            } else {
                builder.push(None);
            }
        }
        builder.finish()
    }
}
