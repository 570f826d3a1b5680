//! Items read from the external source.

use serde::Serialize;

/// One parsed unit of input.
///
/// The value is opaque to the engine. `size_bytes` is the length of the raw
/// record it was parsed from and is what byte limits are measured against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    /// Position in the original source sequence (0-based).
    pub index: u64,
    /// Byte-size estimate of the item.
    pub size_bytes: u64,
    /// The parsed item.
    pub value: serde_json::Value,
}

impl Item {
    pub fn new(index: u64, size_bytes: u64, value: serde_json::Value) -> Self {
        Self {
            index,
            size_bytes,
            value,
        }
    }

    /// Parse a raw record, sizing the item by the record's byte length.
    ///
    /// Bytes that are not valid UTF-8 are a parse error like any other.
    pub fn parse(index: u64, raw: &[u8]) -> Result<Self, serde_json::Error> {
        let value = serde_json::from_slice(raw)?;
        Ok(Self {
            index,
            size_bytes: raw.len() as u64,
            value,
        })
    }
}
