//! Run phases and the per-run context.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::aggregator::OutcomeCollector;
use crate::dispatch::AbortSignal;
use crate::domain::outcome::RunId;
use crate::error::VolleyError;
use crate::events::{EventFeed, RunEvent};

/// Lifecycle phase of a run.
///
/// ```text
/// Idle -> Validating -> Reading -> Dispatching -> Aggregating -> Completed
///              │            │            │              │
///              └────────────┴────────────┴──────────────┴──> Aborted
/// ```
///
/// `Reading` covers opening the source. Once the first page is in hand the
/// run moves to `Dispatching`, where reading, batching and dispatch proceed
/// pipelined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Validating,
    Reading,
    Dispatching,
    Aggregating,
    Completed,
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Validating => "validating",
            RunPhase::Reading => "reading",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Completed => "completed",
            RunPhase::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Aborted)
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Idle, Validating)
            | (Validating, Reading)
            | (Reading, Dispatching)
            | (Dispatching, Aggregating)
            | (Aggregating, Completed) => true,
            (Validating | Reading | Dispatching | Aggregating, Aborted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = VolleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RunPhase::Idle),
            "validating" => Ok(RunPhase::Validating),
            "reading" => Ok(RunPhase::Reading),
            "dispatching" => Ok(RunPhase::Dispatching),
            "aggregating" => Ok(RunPhase::Aggregating),
            "completed" => Ok(RunPhase::Completed),
            "aborted" => Ok(RunPhase::Aborted),
            _ => Err(VolleyError::Other(anyhow::anyhow!("Invalid run phase: {}", s))),
        }
    }
}

/// Everything one run owns. Nothing here is shared between runs.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub abort: AbortSignal,
    pub collector: Arc<OutcomeCollector>,
    pub events: Arc<EventFeed>,
    pub items_read: Arc<AtomicU64>,
    pub batches_assembled: Arc<AtomicU64>,
    phase_tx: watch::Sender<RunPhase>,
}

impl RunContext {
    pub fn new(parent: Option<&CancellationToken>) -> Self {
        let (phase_tx, _) = watch::channel(RunPhase::Idle);
        Self {
            run_id: RunId::new(),
            abort: parent.map(AbortSignal::child_of).unwrap_or_default(),
            collector: Arc::new(OutcomeCollector::new()),
            events: Arc::new(EventFeed::default()),
            items_read: Arc::new(AtomicU64::new(0)),
            batches_assembled: Arc::new(AtomicU64::new(0)),
            phase_tx,
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase_tx.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase_tx.subscribe()
    }

    /// Move to `next`, rejecting transitions the phase machine does not allow.
    pub fn transition(&self, next: RunPhase) -> crate::error::Result<()> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            tracing::error!(run_id = %self.run_id, from = %current, to = %next, "Illegal run phase transition");
            return Err(VolleyError::Other(anyhow::anyhow!(
                "illegal run phase transition {} -> {}",
                current,
                next
            )));
        }
        self.phase_tx.send_replace(next);
        tracing::debug!(run_id = %self.run_id, from = %current, to = %next, "Run phase changed");
        self.events.emit(RunEvent::PhaseChanged {
            from: current,
            to: next,
        });
        Ok(())
    }
}
