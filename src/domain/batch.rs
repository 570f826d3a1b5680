//! Batch types and the policy that bounds them.
//!
//! A batch is an ordered, bounded group of items dispatched as one
//! sub-execution.

use serde::{Deserialize, Serialize};

use super::item::Item;
use crate::error::{Result, VolleyError};

/// Sequence number of a batch within a run.
///
/// Assigned 0-based, contiguous, in item arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl From<u64> for BatchId {
    fn from(id: u64) -> Self {
        BatchId(id)
    }
}

impl std::ops::Deref for BatchId {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Count and size limits used to assemble batches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingPolicy {
    /// Maximum number of items per batch
    pub max_items_per_batch: Option<usize>,

    /// Maximum cumulative item bytes per batch. A single item larger than
    /// this still forms its own batch.
    pub max_bytes_per_batch: Option<u64>,

    /// Static value stamped onto every batch of the run
    pub extra_batch_input: serde_json::Value,
}

impl BatchingPolicy {
    /// Policy bounded by item count only.
    pub fn max_items(max_items: usize) -> Self {
        Self {
            max_items_per_batch: Some(max_items),
            ..Default::default()
        }
    }

    /// Policy bounded by cumulative bytes only.
    pub fn max_bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes_per_batch: Some(max_bytes),
            ..Default::default()
        }
    }

    pub fn with_extra_batch_input(mut self, extra: serde_json::Value) -> Self {
        self.extra_batch_input = extra;
        self
    }

    /// Reject policies that would produce unbounded batches.
    pub fn validate(&self) -> Result<()> {
        if self.max_items_per_batch == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "max_items_per_batch must be positive".to_string(),
            ));
        }
        if self.max_bytes_per_batch == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "max_bytes_per_batch must be positive".to_string(),
            ));
        }
        if self.max_items_per_batch.is_none() && self.max_bytes_per_batch.is_none() {
            return Err(VolleyError::InvalidConfiguration(
                "batching is unbounded: set max_items_per_batch or max_bytes_per_batch".to_string(),
            ));
        }
        Ok(())
    }
}

/// Execution-time metadata attached to every batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMetadata {
    pub items_in_batch: usize,
    pub input_bytes_in_batch: u64,
    pub extra_batch_input: serde_json::Value,
}

/// A closed batch, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub items: Vec<Item>,
    pub metadata: BatchMetadata,
}

impl Batch {
    /// Seal a group of items into a batch, computing its metadata.
    pub fn seal(id: BatchId, items: Vec<Item>, extra_batch_input: serde_json::Value) -> Self {
        let input_bytes_in_batch = items.iter().map(|item| item.size_bytes).sum();
        Self {
            id,
            metadata: BatchMetadata {
                items_in_batch: items.len(),
                input_bytes_in_batch,
                extra_batch_input,
            },
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the first item, if any.
    pub fn first_index(&self) -> Option<u64> {
        self.items.first().map(|item| item.index)
    }

    /// The payload handed to a sub-execution.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "batch_id": self.id.0,
            "items": self.items.iter().map(|item| &item.value).collect::<Vec<_>>(),
            "batch_input": self.metadata.extra_batch_input,
        })
    }
}
