// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

/// Options for the key maps of a hash aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggHashMapOptions {
    /// Maximum number of rows in one chunk
    pub chunk_size: usize,

    /// Whether narrow multi-column keys are stored inline instead of in the key arena
    pub enable_fixed_size_keys: bool,
}

impl Default for AggHashMapOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            enable_fixed_size_keys: true,
        }
    }
}

impl AggHashMapOptions {
    pub fn default_for_test() -> Self {
        Self {
            chunk_size: 64,
            enable_fixed_size_keys: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_partial() {
        let options: AggHashMapOptions = serde_json::from_str(r#"{"chunk_size": 1024}"#).unwrap();
        assert_eq!(options.chunk_size, 1024);
        assert!(options.enable_fixed_size_keys);

        let options: AggHashMapOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, AggHashMapOptions::default());
    }

    #[test]
    fn serialize() {
        let json = serde_json::to_string(&AggHashMapOptions::default_for_test()).unwrap();
        assert_eq!(json, r#"{"chunk_size":64,"enable_fixed_size_keys":true}"#);
    }
}
