// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::iter::FromIterator;
use std::mem;

use bitvec::vec::BitVec;

use super::{Array, ArrayBuilder};
use crate::types::NativeType;

/// A collection of primitive types, such as `i32`, `F64`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveArray<T: NativeType> {
    valid: BitVec,
    data: Box<[T]>,
}

// Enable `collect()` an array from iterator of `Option<T>`.
impl<T: NativeType> FromIterator<Option<T>> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = Option<T>>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut builder = <Self as Array>::Builder::with_capacity(iter.size_hint().0);
        for e in iter {
            builder.push(e.as_ref());
        }
        builder.finish()
    }
}

// Enable `collect()` an array from iterator of `T`.
impl<T: NativeType> FromIterator<T> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let data: Box<[T]> = iter.into_iter().collect();
        let size = data.len();
        Self {
            data,
            valid: BitVec::repeat(true, size),
        }
    }
}

impl<T: NativeType> Array for PrimitiveArray<T> {
    type Item = T;
    type Builder = PrimitiveArrayBuilder<T>;

    fn is_null(&self, idx: usize) -> bool {
        !self.valid[idx]
    }

    fn get_raw(&self, idx: usize) -> &T {
        &self.data[idx]
    }

    fn len(&self) -> usize {
        self.valid.len()
    }

    fn has_null(&self) -> bool {
        self.valid.not_all()
    }
}

impl<T: NativeType> PrimitiveArray<T> {
    /// Returns the raw values, including the default placeholder under each null.
    pub fn raw_data(&self) -> &[T] {
        &self.data
    }
}

/// A builder that constructs a [`PrimitiveArray`] from `Option<T>`.
pub struct PrimitiveArrayBuilder<T: NativeType> {
    valid: BitVec,
    data: Vec<T>,
}

impl<T: NativeType> ArrayBuilder for PrimitiveArrayBuilder<T> {
    type Array = PrimitiveArray<T>;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            valid: BitVec::with_capacity(capacity),
            data: Vec::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.valid.len()
    }

    fn push(&mut self, value: Option<&T>) {
        self.valid.push(value.is_some());
        self.data.push(value.cloned().unwrap_or_default());
    }

    fn take(&mut self) -> PrimitiveArray<T> {
        PrimitiveArray {
            valid: mem::take(&mut self.valid),
            data: mem::take(&mut self.data).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::F64;

    fn test_builder<T: NativeType>(f: impl Fn(usize) -> T) {
        let iter = (0..1000).map(|x| if x % 2 == 0 { None } else { Some(f(x)) });
        let array = iter.clone().collect::<PrimitiveArray<T>>();
        assert!(array.has_null());
        assert_eq!(
            (0..array.len()).map(|i| array.get(i).cloned()).collect::<Vec<_>>(),
            iter.collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_builder_i16() {
        test_builder(|x| x as i16);
    }

    #[test]
    fn test_builder_i32() {
        test_builder(|x| x as i32);
    }

    #[test]
    fn test_builder_i64() {
        test_builder(|x| x as i64);
    }

    #[test]
    fn test_builder_f64() {
        test_builder(|x| F64::from(x as f64));
    }

    #[test]
    fn no_null() {
        let array: PrimitiveArray<i32> = (0..10).collect();
        assert!(!array.has_null());
        assert_eq!(array.raw_data()[3], 3);
    }

    #[test]
    fn push_and_take() {
        let mut builder = PrimitiveArrayBuilder::with_capacity(4);
        for _ in 0..2 {
            builder.push(Some(&1));
            builder.push(None);
        }
        assert_eq!(builder.len(), 4);
        let b = builder.take();
        assert_eq!(b.get(2), Some(&1));
        assert_eq!(b.get(3), None);
        assert!(builder.is_empty());
    }
}
