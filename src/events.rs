//! In-memory event feed for a run.
//!
//! Every notable step of a run (phase changes, batch lifecycle, abort) is
//! appended to the run's history and broadcast to live subscribers. The
//! history lives as long as the run's context and is never persisted.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::domain::batch::BatchId;
use crate::domain::outcome::{AbortReason, OutcomeStatus, RunStatus};
use crate::engine::RunPhase;

/// Default capacity of the live broadcast buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseChanged {
        from: RunPhase,
        to: RunPhase,
    },
    BatchAssembled {
        batch_id: BatchId,
        items_in_batch: usize,
        input_bytes_in_batch: u64,
    },
    BatchStarted {
        batch_id: BatchId,
        attempt: u32,
    },
    BatchRetryScheduled {
        batch_id: BatchId,
        next_attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    BatchFinished {
        batch_id: BatchId,
        status: OutcomeStatus,
        attempts: u32,
    },
    BatchCancelled {
        batch_id: BatchId,
    },
    RunAborted {
        reason: AbortReason,
    },
    RunFinished {
        status: RunStatus,
    },
}

/// A sequenced, timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// 0-based position in the run's history
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send>>;

/// History plus live fan-out for one run.
#[derive(Debug)]
pub struct EventFeed {
    tx: broadcast::Sender<EventRecord>,
    next_seq: AtomicU64,
    history: Mutex<Vec<EventRecord>>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_seq: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, event: RunEvent) {
        // Sequence under the history lock so history order matches seq order
        let mut history = self.history.lock();
        let record = EventRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        };
        history.push(record.clone());
        drop(history);

        // No subscribers is fine
        let _ = self.tx.send(record);
    }

    /// Live events from now on. A subscriber that falls behind by more than
    /// the buffer capacity skips the missed events.
    pub fn subscribe(&self) -> EventStream {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|res| async move {
            match res {
                Ok(record) => Some(record),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Everything emitted so far, in order.
    pub fn history(&self) -> Vec<EventRecord> {
        self.history.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_and_live_subscribers_see_same_order() {
        let feed = EventFeed::new(16);
        let mut live = feed.subscribe();

        feed.emit(RunEvent::BatchStarted {
            batch_id: BatchId(0),
            attempt: 1,
        });
        feed.emit(RunEvent::BatchFinished {
            batch_id: BatchId(0),
            status: OutcomeStatus::Succeeded,
            attempts: 1,
        });

        let history = feed.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 0);
        assert_eq!(history[1].seq, 1);

        assert_eq!(live.next().await.unwrap(), history[0]);
        assert_eq!(live.next().await.unwrap(), history[1]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_missed_events() {
        let feed = EventFeed::new(2);
        let mut live = feed.subscribe();

        for id in 0..5 {
            feed.emit(RunEvent::BatchCancelled { batch_id: BatchId(id) });
        }

        // Only the last two fit in the buffer
        let first = live.next().await.unwrap();
        assert_eq!(first.seq, 3);
        assert_eq!(feed.len(), 5);
    }

    #[test]
    fn test_event_serialization_is_flat() {
        let feed = EventFeed::default();
        feed.emit(RunEvent::PhaseChanged {
            from: RunPhase::Idle,
            to: RunPhase::Validating,
        });
        let json = serde_json::to_value(&feed.history()[0]).unwrap();
        assert_eq!(json["type"], "phase_changed");
        assert_eq!(json["from"], "idle");
        assert_eq!(json["to"], "validating");
        assert_eq!(json["seq"], 0);
    }
}
