// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use smallvec::SmallVec;

use super::*;

/// A collection of arrays.
///
/// A chunk is a horizontal subset of the rows being grouped.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DataChunk {
    arrays: SmallVec<[ArrayImpl; 16]>,
    cardinality: usize,
}

impl FromIterator<ArrayImpl> for DataChunk {
    fn from_iter<I: IntoIterator<Item = ArrayImpl>>(iter: I) -> Self {
        let arrays: SmallVec<[ArrayImpl; 16]> = iter.into_iter().collect();
        let cardinality = arrays.first().map(ArrayImpl::len).unwrap_or(0);
        assert!(
            arrays.iter().map(|a| a.len()).all(|l| l == cardinality),
            "all arrays must have the same length"
        );
        DataChunk {
            arrays,
            cardinality,
        }
    }
}

impl DataChunk {
    /// Return the number of rows in the chunk.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Get all arrays.
    pub fn arrays(&self) -> &[ArrayImpl] {
        &self.arrays
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinality() {
        let chunk: DataChunk = [
            ArrayImpl::Int32([1, 2].into_iter().collect()),
            ArrayImpl::Utf8([Some("a"), None].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        assert_eq!(chunk.cardinality(), 2);
        assert_eq!(chunk.arrays().len(), 2);
        assert!(DataChunk::default().arrays().is_empty());
    }
}
