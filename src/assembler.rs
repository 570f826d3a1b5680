//! Groups a stream of items into bounded, ordered batches.
//!
//! Items are appended to an open accumulator in arrival order. The
//! accumulator is closed into a [`Batch`] when the next item would push it
//! past the byte limit or when it reaches the item limit. An item that alone
//! exceeds the byte limit is never rejected: it becomes a batch of its own.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};

use crate::domain::batch::{Batch, BatchId, BatchingPolicy};
use crate::domain::item::Item;
use crate::error::Result;

/// Stream of assembled batches.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Batch>> + Send>>;

/// Incremental batch builder.
///
/// Assumes a validated policy; an unbounded policy simply never closes a
/// batch before `finish`.
#[derive(Debug)]
pub struct BatchAssembler {
    policy: BatchingPolicy,
    current: Vec<Item>,
    current_bytes: u64,
    next_id: u64,
}

impl BatchAssembler {
    pub fn new(policy: BatchingPolicy) -> Self {
        Self {
            policy,
            current: Vec::new(),
            current_bytes: 0,
            next_id: 0,
        }
    }

    /// Number of batches closed so far.
    pub fn batches_closed(&self) -> u64 {
        self.next_id
    }

    /// Add an item, returning any batches it caused to close (at most two:
    /// the previous accumulator and an oversized singleton).
    pub fn push(&mut self, item: Item) -> Vec<Batch> {
        let mut closed = Vec::new();

        if let Some(max_bytes) = self.policy.max_bytes_per_batch {
            if !self.current.is_empty()
                && self.current_bytes.saturating_add(item.size_bytes) > max_bytes
            {
                closed.extend(self.close());
            }

            if self.current.is_empty() && item.size_bytes > max_bytes {
                tracing::warn!(
                    index = item.index,
                    size_bytes = item.size_bytes,
                    max_bytes,
                    "Item exceeds max_bytes_per_batch on its own, dispatching as a singleton batch"
                );
                closed.push(self.seal(vec![item]));
                return closed;
            }
        }

        self.current_bytes += item.size_bytes;
        self.current.push(item);

        if self
            .policy
            .max_items_per_batch
            .is_some_and(|max| self.current.len() >= max)
        {
            closed.extend(self.close());
        }

        closed
    }

    /// Close the trailing accumulator at end of stream.
    pub fn finish(&mut self) -> Option<Batch> {
        self.close()
    }

    fn close(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.current);
        self.current_bytes = 0;
        Some(self.seal(items))
    }

    fn seal(&mut self, items: Vec<Item>) -> Batch {
        let id = BatchId(self.next_id);
        self.next_id += 1;
        let batch = Batch::seal(id, items, self.policy.extra_batch_input.clone());
        tracing::trace!(
            batch_id = %batch.id,
            items = batch.metadata.items_in_batch,
            bytes = batch.metadata.input_bytes_in_batch,
            "Closed batch"
        );
        batch
    }
}

struct AssemblyState<S> {
    items: S,
    assembler: BatchAssembler,
    ready: VecDeque<Batch>,
    done: bool,
}

/// Adapt an item stream into a lazy batch stream.
///
/// An upstream error is forwarded once and ends the stream; the open
/// accumulator at that point is discarded.
pub fn assemble<S>(items: S, policy: BatchingPolicy) -> BatchStream
where
    S: Stream<Item = Result<Item>> + Send + Unpin + 'static,
{
    let state = AssemblyState {
        items,
        assembler: BatchAssembler::new(policy),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(batch) = state.ready.pop_front() {
                return Some((Ok(batch), state));
            }
            if state.done {
                return None;
            }
            match state.items.next().await {
                Some(Ok(item)) => state.ready.extend(state.assembler.push(item)),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.assembler.finish());
                }
            }
        }
    }))
}
