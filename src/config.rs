//! Engine configuration.
//!
//! A run is described by one [`EngineConfig`], parsed once at the boundary and
//! validated before any I/O happens. Every section has defaults, so a minimal
//! configuration names only the source and a batching limit:
//!
//! ```json
//! {
//!   "reader": { "source_locator": "items.jsonl" },
//!   "batching": { "max_items_per_batch": 50 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchConfig;
use crate::domain::batch::BatchingPolicy;
use crate::error::{Result, VolleyError};
use crate::reader::ReaderConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reader: ReaderConfig,
    pub batching: BatchingPolicy,
    pub dispatch: DispatchConfig,

    /// Global deadline for the whole run in milliseconds. Exceeding it aborts the run.
    pub run_deadline_ms: Option<u64>,
}

impl EngineConfig {
    pub fn new(reader: ReaderConfig, batching: BatchingPolicy) -> Self {
        Self {
            reader,
            batching,
            ..Default::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_run_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.run_deadline_ms = Some(deadline_ms);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            VolleyError::InvalidConfiguration(format!("failed to parse engine configuration: {}", e))
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_ms.map(Duration::from_millis)
    }

    /// Check every section. The first violation is reported.
    pub fn validate(&self) -> Result<()> {
        self.reader.validate()?;
        self.batching.validate()?;
        self.dispatch.validate()?;
        if self.run_deadline_ms == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "run_deadline_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
