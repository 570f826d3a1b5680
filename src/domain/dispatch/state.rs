//! Dispatch lifecycle types.
//!
//! Each batch handed to a worker moves through distinct states, enforced at
//! compile time by the type parameter on [`Dispatch`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::domain::batch::{Batch, BatchId};
use crate::domain::outcome::{BatchResult, ExecutionOutcome};
use crate::error::error_serialization::ErrorDetail;
use crate::invoker::InvocationResult;

/// Marker trait for valid dispatch states.
pub trait DispatchState: Send {}

/// A batch being driven to an outcome by one worker.
///
/// The worker owns the dispatch exclusively; the batch is shared only with the
/// spawned invocation task for the attempt in progress.
#[derive(Debug)]
pub struct Dispatch<T: DispatchState> {
    pub state: T,
    pub batch: Arc<Batch>,
}

impl<T: DispatchState> Dispatch<T> {
    pub fn batch_id(&self) -> BatchId {
        self.batch.id
    }
}

// ============================================================================
// Dispatch States
// ============================================================================

/// Waiting to be invoked.
#[derive(Debug, Clone)]
pub struct Queued {
    /// Attempts already made (0 before the first invocation)
    pub attempts: u32,

    /// Delay to observe before the next attempt starts
    pub backoff: Option<Duration>,

    /// When the first attempt started, if any
    pub first_started_at: Option<DateTime<Utc>>,
}

impl DispatchState for Queued {}

/// Invocation running in a spawned task.
#[derive(Debug)]
pub struct InFlight {
    /// 1-based number of this attempt
    pub attempt: u32,
    pub first_started_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Per-attempt deadline, if a timeout is configured
    pub deadline: Option<tokio::time::Instant>,
    pub timeout: Option<Duration>,
    pub result_rx: oneshot::Receiver<InvocationResult>,
    pub abort_handle: AbortHandle,
}

impl DispatchState for InFlight {}

// The invocation task is detached from whoever drives the dispatch, so it
// must not outlive the InFlight state that owns its handle.
impl Drop for InFlight {
    fn drop(&mut self) {
        self.abort_handle.abort();
    }
}

#[derive(Debug, Clone)]
pub struct Succeeded {
    pub output: serde_json::Value,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DispatchState for Succeeded {}

/// Reason an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// The invoker reported a transient failure.
    Retryable { error: String },

    /// The invoker rejected the batch outright.
    NonRetryable { error: String },

    /// The invocation task ended without producing a result (panic).
    TaskTerminated,
}

impl FailureReason {
    pub fn is_retriable(&self) -> bool {
        match self {
            FailureReason::Retryable { .. } => true,
            FailureReason::NonRetryable { .. } => false,
            FailureReason::TaskTerminated => true,
        }
    }

    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::Retryable { error } => format!("Retryable failure: {}", error),
            FailureReason::NonRetryable { error } => format!("Non-retryable failure: {}", error),
            FailureReason::TaskTerminated => "Invocation task terminated unexpectedly".to_string(),
        }
    }
}

/// Attempt failed. May go back to `Queued` through `can_retry`.
#[derive(Debug, Clone)]
pub struct Failed {
    pub reason: FailureReason,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl DispatchState for Failed {}

#[derive(Debug, Clone)]
pub struct TimedOut {
    pub message: String,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub timed_out_at: DateTime<Utc>,
}

impl DispatchState for TimedOut {}

/// Stopped by a run abort. Produces no outcome.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub attempts: u32,
    pub cancelled_at: DateTime<Utc>,
}

impl DispatchState for Cancelled {}

/// Where an in-flight attempt ended up.
#[derive(Debug)]
pub enum DispatchCompletion {
    Succeeded(Dispatch<Succeeded>),
    Failed(Dispatch<Failed>),
    TimedOut(Dispatch<TimedOut>),
    Cancelled(Dispatch<Cancelled>),
}

impl DispatchCompletion {
    pub fn variant(&self) -> &'static str {
        match self {
            DispatchCompletion::Succeeded(_) => "Succeeded",
            DispatchCompletion::Failed(_) => "Failed",
            DispatchCompletion::TimedOut(_) => "TimedOut",
            DispatchCompletion::Cancelled(_) => "Cancelled",
        }
    }
}

// ============================================================================
// Terminal states to outcomes
// ============================================================================

impl Dispatch<Succeeded> {
    pub fn into_outcome(self) -> ExecutionOutcome {
        ExecutionOutcome {
            batch_id: self.batch.id,
            attempts: self.state.attempts,
            items_in_batch: self.batch.len(),
            started_at: self.state.started_at,
            finished_at: self.state.finished_at,
            result: BatchResult::Succeeded(self.state.output),
        }
    }
}

impl Dispatch<Failed> {
    pub fn into_outcome(self) -> ExecutionOutcome {
        let mut detail = ErrorDetail::new(self.state.reason.to_error_message());
        if self.state.reason.is_retriable() {
            detail
                .sources
                .push(format!("gave up after {} attempts", self.state.attempts));
        }
        ExecutionOutcome {
            batch_id: self.batch.id,
            attempts: self.state.attempts,
            items_in_batch: self.batch.len(),
            started_at: self.state.started_at,
            finished_at: self.state.failed_at,
            result: BatchResult::Failed(detail),
        }
    }
}

impl Dispatch<TimedOut> {
    pub fn into_outcome(self) -> ExecutionOutcome {
        ExecutionOutcome {
            batch_id: self.batch.id,
            attempts: self.state.attempts,
            items_in_batch: self.batch.len(),
            started_at: self.state.started_at,
            finished_at: self.state.timed_out_at,
            result: BatchResult::TimedOut(ErrorDetail::new(self.state.message)),
        }
    }
}
