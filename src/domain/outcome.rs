//! Per-batch outcomes and the aggregate result of a run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::batch::BatchId;
use crate::error::error_serialization::ErrorDetail;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        RunId(uuid)
    }
}

/// Terminal status of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::TimedOut => "timed_out",
        }
    }

    /// Failed and TimedOut both count as failure at run level.
    pub fn is_failure(&self) -> bool {
        !matches!(self, OutcomeStatus::Succeeded)
    }
}

/// What a batch produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum BatchResult {
    /// Result payload returned by the sub-execution.
    Succeeded(serde_json::Value),
    /// Non-retryable failure, or retryable failure with attempts exhausted.
    Failed(ErrorDetail),
    /// The invocation exceeded its deadline.
    TimedOut(ErrorDetail),
}

/// Recorded outcome of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub batch_id: BatchId,
    /// Number of invocations made, including the final one.
    pub attempts: u32,
    pub items_in_batch: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: BatchResult,
}

impl ExecutionOutcome {
    pub fn status(&self) -> OutcomeStatus {
        match self.result {
            BatchResult::Succeeded(_) => OutcomeStatus::Succeeded,
            BatchResult::Failed(_) => OutcomeStatus::Failed,
            BatchResult::TimedOut(_) => OutcomeStatus::TimedOut,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == OutcomeStatus::Succeeded
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        match &self.result {
            BatchResult::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// Equality ignoring `started_at` and `finished_at`.
    pub fn is_equivalent_to(&self, other: &ExecutionOutcome) -> bool {
        self.batch_id == other.batch_id
            && self.attempts == other.attempts
            && self.items_in_batch == other.items_in_batch
            && self.result == other.result
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        match &self.result {
            BatchResult::Succeeded(_) => None,
            BatchResult::Failed(detail) | BatchResult::TimedOut(detail) => Some(detail),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every batch succeeded (vacuously true for an empty source).
    Succeeded,
    /// The run completed but at least one batch failed or timed out.
    Failed,
    /// The run was stopped before every batch had an outcome.
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "details", rename_all = "snake_case")]
pub enum AbortReason {
    /// Fail-fast policy tripped by the given batch.
    FailFast { batch_id: BatchId },
    /// The global run deadline elapsed.
    DeadlineExceeded { deadline_ms: u64 },
    /// The caller asked the run to stop.
    Cancelled,
    /// Reading the item source failed mid-run.
    SourceFailed(ErrorDetail),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::FailFast { batch_id } => write!(f, "batch {} failed (fail-fast)", batch_id),
            AbortReason::DeadlineExceeded { deadline_ms } => {
                write!(f, "run deadline of {}ms exceeded", deadline_ms)
            }
            AbortReason::Cancelled => write!(f, "cancelled by caller"),
            AbortReason::SourceFailed(detail) => write!(f, "source failed: {}", detail.message),
        }
    }
}

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub items_read: u64,
    pub batches_assembled: u64,
    pub batches_dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retries: u64,
}

/// Final, ordered summary of a run.
///
/// `run_id` and the per-outcome `started_at`/`finished_at` timestamps differ
/// between any two runs, so `==` never holds across reruns. Use
/// [`RunResult::is_equivalent_to`] to compare what two runs produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Outcomes in BatchId order.
    pub outcomes: Vec<ExecutionOutcome>,
    /// Batches whose invocation was cancelled by an abort, in BatchId order.
    pub cancelled: Vec<BatchId>,
    pub abort_reason: Option<AbortReason>,
    pub stats: RunStats,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }

    pub fn outcome(&self, batch_id: BatchId) -> Option<&ExecutionOutcome> {
        self.outcomes
            .binary_search_by_key(&batch_id, |o| o.batch_id)
            .ok()
            .map(|i| &self.outcomes[i])
    }

    /// Outcomes that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Equality ignoring the run id and wall-clock timestamps.
    pub fn is_equivalent_to(&self, other: &RunResult) -> bool {
        self.status == other.status
            && self.cancelled == other.cancelled
            && self.abort_reason == other.abort_reason
            && self.stats == other.stats
            && self.outcomes.len() == other.outcomes.len()
            && self
                .outcomes
                .iter()
                .zip(&other.outcomes)
                .all(|(a, b)| a.is_equivalent_to(b))
    }
}
