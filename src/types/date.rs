// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt::{Display, Formatter};

/// Date type, stored as the number of days since 1970-01-01.
#[derive(PartialOrd, Ord, PartialEq, Eq, Hash, Debug, Copy, Clone, Default)]
pub struct Date(i32);

impl Date {
    pub const fn new(inner: i32) -> Self {
        Date(inner)
    }

    /// Get the inner value of date type
    pub const fn get_inner(&self) -> i32 {
        self.0
    }
}

impl Display for Date {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "date({})", self.0)
    }
}
