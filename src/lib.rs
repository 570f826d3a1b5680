//! Batched map execution engine.
//!
//! Volley streams items lazily from an external source, packs them into
//! batches bounded by item count and byte size, and fans each batch out to a
//! sub-execution through a [`SubExecutionInvoker`]. Dispatch is bounded by a
//! concurrency limit, failed invocations are retried with exponential backoff,
//! and a failure policy decides whether one failed batch aborts the whole run.
//!
//! A run moves through the phases of [`RunPhase`] and ends with a
//! [`RunResult`] whose outcomes are ordered by batch id, whatever order the
//! sub-executions finished in.
//!
//! ```no_run
//! use std::sync::Arc;
//! use volley::{BatchingPolicy, Engine, EngineConfig, JsonLinesSource, ReaderConfig, ReqwestInvoker};
//!
//! # async fn example() -> volley::Result<()> {
//! let config = EngineConfig::new(ReaderConfig::new("items.jsonl"), BatchingPolicy::max_items(50));
//! let engine = Engine::new(
//!     config,
//!     Arc::new(JsonLinesSource::new()),
//!     Arc::new(ReqwestInvoker::new("http://localhost:8080/process")),
//! );
//!
//! let result = engine.run().await?;
//! println!("{} batches, status {}", result.outcomes.len(), result.status);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod assembler;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod invoker;
pub mod metrics;
pub mod reader;
pub mod source;

// Re-export commonly used types
pub use aggregator::{OutcomeCollector, aggregate};
pub use assembler::{BatchAssembler, assemble};
pub use config::EngineConfig;
pub use dispatch::{AbortSignal, DispatchConfig, FailurePolicy, Scheduler};
pub use domain::batch::{Batch, BatchId, BatchingPolicy};
pub use domain::dispatch::RetryConfig;
pub use domain::item::Item;
pub use domain::outcome::{
    AbortReason, BatchResult, ExecutionOutcome, OutcomeStatus, RunId, RunResult, RunStats, RunStatus,
};
pub use engine::{Engine, RunHandle, RunPhase};
pub use error::{Result, VolleyError};
pub use events::{EventRecord, RunEvent};
pub use invoker::{InvocationError, InvocationResult, MockInvoker, ReqwestInvoker, SubExecutionInvoker};
pub use reader::{ItemReader, ReaderConfig};
pub use source::{ItemSource, JsonLinesSource, MockItemSource, SourceLocator};
