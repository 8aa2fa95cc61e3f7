// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Key maps of the vectorized hash aggregation.
//!
//! Each map turns the group-by key columns of a chunk into one aggregate
//! state handle per row, creating a state the first time a key is seen.
//! [`hash_map::AggHashMapVariant`] picks the map for a set of key types.

#![deny(unused_must_use)]

pub mod array;
mod error;
pub mod hash_map;
pub mod types;

pub use self::error::{Error, Result};
