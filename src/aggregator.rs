//! Outcome collection and aggregation.
//!
//! Workers finish in any order. [`OutcomeCollector`] buffers their outcomes
//! keyed by BatchId; [`aggregate`] turns a set of outcomes into a
//! [`RunResult`] ordered by BatchId.

use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;

use crate::domain::batch::BatchId;
use crate::domain::outcome::{ExecutionOutcome, OutcomeStatus, RunId, RunResult, RunStats, RunStatus};

/// Build a run result from outcomes in any order.
///
/// The status is `Succeeded` iff every outcome succeeded, which holds
/// vacuously for no outcomes; otherwise `Failed`. Callers that aborted the run
/// override the status afterwards.
pub fn aggregate(run_id: RunId, outcomes: impl IntoIterator<Item = ExecutionOutcome>) -> RunResult {
    let mut outcomes: Vec<ExecutionOutcome> = outcomes.into_iter().collect();
    outcomes.sort_by_key(|o| o.batch_id);

    let mut stats = RunStats {
        batches_dispatched: outcomes.len() as u64,
        ..Default::default()
    };
    for outcome in &outcomes {
        match outcome.status() {
            OutcomeStatus::Succeeded => stats.succeeded += 1,
            OutcomeStatus::Failed => stats.failed += 1,
            OutcomeStatus::TimedOut => stats.timed_out += 1,
        }
        stats.retries += u64::from(outcome.attempts.saturating_sub(1));
    }

    let status = if outcomes.iter().all(|o| o.is_success()) {
        RunStatus::Succeeded
    } else {
        RunStatus::Failed
    };

    RunResult {
        run_id,
        status,
        outcomes,
        cancelled: Vec::new(),
        abort_reason: None,
        stats,
    }
}

/// Concurrent outcome buffer shared by the workers of one run.
#[derive(Debug, Default)]
pub struct OutcomeCollector {
    outcomes: DashMap<BatchId, ExecutionOutcome>,
    cancelled: DashSet<BatchId>,
}

impl OutcomeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal outcome. The first outcome for a BatchId wins; a
    /// duplicate is dropped and `false` returned.
    pub fn record(&self, outcome: ExecutionOutcome) -> bool {
        match self.outcomes.entry(outcome.batch_id) {
            Entry::Occupied(existing) => {
                tracing::warn!(
                    batch_id = %outcome.batch_id,
                    existing = existing.get().status().as_str(),
                    rejected = outcome.status().as_str(),
                    "Duplicate outcome for batch ignored"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(outcome);
                true
            }
        }
    }

    /// Note a batch whose invocation was cancelled before it produced an outcome.
    pub fn record_cancelled(&self, batch_id: BatchId) -> bool {
        if self.outcomes.contains_key(&batch_id) {
            tracing::warn!(batch_id = %batch_id, "Batch already has an outcome, not marking cancelled");
            return false;
        }
        self.cancelled.insert(batch_id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn contains(&self, batch_id: BatchId) -> bool {
        self.outcomes.contains_key(&batch_id)
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.len()
    }

    /// Ordered result over everything recorded so far.
    pub fn to_run_result(&self, run_id: RunId) -> RunResult {
        let outcomes: Vec<ExecutionOutcome> = self.outcomes.iter().map(|e| e.value().clone()).collect();
        let mut result = aggregate(run_id, outcomes);

        let mut cancelled: Vec<BatchId> = self.cancelled.iter().map(|id| *id).collect();
        cancelled.sort();
        result.stats.cancelled = cancelled.len() as u64;
        result.cancelled = cancelled;
        result
    }
}
