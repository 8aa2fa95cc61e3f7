// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt::Debug;

use super::date::Date;
use super::F64;

pub trait NativeType:
    PartialOrd + PartialEq + Debug + Copy + Send + Sync + Sized + Default + 'static
{
}

macro_rules! impl_native {
    ($($t:ty),*) => {
        $(impl NativeType for $t {})*
    }
}

impl_native!(bool, i16, i32, i64, F64, Date);

/// Bits of a float with every NaN and both zeros collapsed, so equal values group together.
pub fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}
