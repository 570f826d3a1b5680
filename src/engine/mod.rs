//! Engine orchestrator: one managed run from configuration to [`RunResult`].
//!
//! A run validates its configuration, opens the item source, and then runs
//! the reader and assembler as a single producer task feeding a bounded queue
//! that the [`Scheduler`] drains. The phase of the run is observable through
//! [`RunHandle`], as is its event feed.
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembler::assemble;
use crate::config::EngineConfig;
use crate::dispatch::{AbortSignal, DispatchSummary, FailurePolicy, Scheduler};
use crate::domain::batch::{Batch, BatchingPolicy};
use crate::domain::outcome::{AbortReason, RunId, RunResult, RunStatus};
use crate::error::error_serialization::ErrorDetail;
use crate::error::{Result, VolleyError};
use crate::events::{EventRecord, EventStream, RunEvent};
use crate::invoker::SubExecutionInvoker;
use crate::reader::{ItemReader, ItemStream};
use crate::source::ItemSource;

pub mod types;

pub use types::{RunContext, RunPhase};

/// Runs batched map executions of one configuration.
///
/// The engine itself holds no run state; each call to [`Engine::run`] or
/// [`Engine::start`] builds a fresh [`RunContext`], so runs are independent
/// and may proceed concurrently.
pub struct Engine<S, I>
where
    S: ItemSource + 'static,
    I: SubExecutionInvoker,
{
    config: EngineConfig,
    source: Arc<S>,
    invoker: Arc<I>,
    shutdown_token: Option<CancellationToken>,
}

impl<S, I> Clone for Engine<S, I>
where
    S: ItemSource + 'static,
    I: SubExecutionInvoker,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            source: self.source.clone(),
            invoker: self.invoker.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }
}

impl<S, I> Engine<S, I>
where
    S: ItemSource + 'static,
    I: SubExecutionInvoker,
{
    pub fn new(config: EngineConfig, source: Arc<S>, invoker: Arc<I>) -> Self {
        Self {
            config,
            source,
            invoker,
            shutdown_token: None,
        }
    }

    /// Tie every run to a host shutdown token. Cancelling it aborts running
    /// runs with [`AbortReason::Cancelled`].
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run to completion on the current task.
    pub async fn run(&self) -> Result<RunResult> {
        let ctx = Arc::new(RunContext::new(self.shutdown_token.as_ref()));
        self.execute(ctx).await
    }

    /// Spawn a run and return a handle to observe or abort it.
    pub fn start(&self) -> RunHandle {
        let ctx = Arc::new(RunContext::new(self.shutdown_token.as_ref()));
        let engine = self.clone();
        let run_ctx = ctx.clone();
        let join = tokio::spawn(async move { engine.execute(run_ctx).await });
        RunHandle { ctx, join }
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id))]
    async fn execute(&self, ctx: Arc<RunContext>) -> Result<RunResult> {
        let started = Instant::now();
        tracing::info!(locator = %self.config.reader.source_locator, "Run starting");

        // Validating: nothing touches the source before the config is known good
        ctx.transition(RunPhase::Validating)?;
        if let Err(e) = self.config.validate() {
            tracing::error!(error = %e, "Configuration rejected");
            ctx.transition(RunPhase::Aborted)?;
            return Err(e);
        }

        // Reading
        ctx.transition(RunPhase::Reading)?;
        let deadline_task = self.spawn_deadline(&ctx.abort);

        let opened = tokio::select! {
            biased;
            _ = ctx.abort.raised() => None,
            opened = ItemReader::open(self.source.clone(), self.config.reader.clone()) => Some(opened),
        };

        let items = match opened {
            Some(Ok(items)) => items,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to open item source");
                stop_deadline(deadline_task);
                ctx.transition(RunPhase::Aborted)?;
                return Err(e);
            }
            None => {
                stop_deadline(deadline_task);
                return self.finalize(&ctx, DispatchSummary::default(), None, started);
            }
        };

        // Dispatching: producer and scheduler run pipelined
        ctx.transition(RunPhase::Dispatching)?;

        let (tx, rx) = mpsc::channel(self.config.dispatch.queue_depth);
        let producer = tokio::spawn(produce(
            items,
            self.config.batching.clone(),
            self.config.dispatch.failure_policy,
            tx,
            ctx.clone(),
        ));

        let scheduler = Scheduler::new(
            self.config.dispatch.clone(),
            self.invoker.clone(),
            ctx.collector.clone(),
            ctx.events.clone(),
            ctx.abort.clone(),
        );
        let summary = scheduler.run(rx).await;

        let read_error = match producer.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_error) => {
                tracing::error!(error = %join_error, "Producer task panicked");
                Some(VolleyError::Other(anyhow::anyhow!(
                    "producer task failed: {}",
                    join_error
                )))
            }
        };
        stop_deadline(deadline_task);

        self.finalize(&ctx, summary, read_error, started)
    }

    fn spawn_deadline(&self, abort: &AbortSignal) -> Option<JoinHandle<()>> {
        let deadline = self.config.run_deadline()?;
        let deadline_ms = deadline.as_millis() as u64;
        let abort = abort.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    abort.raise(AbortReason::DeadlineExceeded { deadline_ms });
                }
                _ = abort.raised() => {}
            }
        }))
    }

    /// Build the final result and move the run to its terminal phase.
    fn finalize(
        &self,
        ctx: &RunContext,
        summary: DispatchSummary,
        read_error: Option<VolleyError>,
        started: Instant,
    ) -> Result<RunResult> {
        let abort_reason = ctx.abort.reason().or_else(|| {
            read_error
                .as_ref()
                .map(|e| AbortReason::SourceFailed(ErrorDetail::from_error(e)))
        });

        if abort_reason.is_none() {
            ctx.transition(RunPhase::Aggregating)?;
        }

        let mut result = ctx.collector.to_run_result(ctx.run_id);
        result.stats.items_read = ctx.items_read.load(Ordering::Relaxed);
        result.stats.batches_assembled = ctx.batches_assembled.load(Ordering::Relaxed);
        result.stats.batches_dispatched = summary.batches_dispatched;
        result.stats.retries = summary.retries;

        match abort_reason {
            Some(reason) => {
                result.status = RunStatus::Aborted;
                result.abort_reason = Some(reason.clone());
                ctx.transition(RunPhase::Aborted)?;
                ctx.events.emit(RunEvent::RunAborted { reason });
            }
            None => {
                ctx.transition(RunPhase::Completed)?;
            }
        }
        ctx.events.emit(RunEvent::RunFinished {
            status: result.status,
        });

        let elapsed = started.elapsed();
        crate::metrics::record_run_finished(result.status, elapsed);
        tracing::info!(
            status = %result.status,
            abort_reason = result.abort_reason.as_ref().map(|r| r.to_string()),
            outcomes = result.outcomes.len(),
            cancelled = result.cancelled.len(),
            items_read = result.stats.items_read,
            elapsed_ms = elapsed.as_millis() as u64,
            "Run finished"
        );

        match read_error {
            Some(cause) => Err(VolleyError::ReadAborted {
                cause: Box::new(cause),
                partial: Box::new(result),
            }),
            None => Ok(result),
        }
    }
}

fn stop_deadline(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Reader and assembler as one producer feeding the dispatch queue.
///
/// Returns the reading error, if any. Under FailFast the error also raises
/// the run abort so in-flight work is cancelled at once.
async fn produce(
    items: ItemStream,
    policy: BatchingPolicy,
    failure_policy: FailurePolicy,
    tx: mpsc::Sender<Batch>,
    ctx: Arc<RunContext>,
) -> Result<()> {
    let items_read = ctx.items_read.clone();
    let counted = items.inspect(move |item| {
        if item.is_ok() {
            items_read.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_items_read(1);
        }
    });
    let mut batches = assemble(counted, policy);

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.abort.raised() => {
                tracing::debug!("Abort raised, producer stopping");
                return Ok(());
            }
            next = batches.next() => next,
        };

        let batch = match next {
            None => {
                tracing::debug!(
                    batches = ctx.batches_assembled.load(Ordering::Relaxed),
                    "All batches assembled"
                );
                return Ok(());
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Reading failed, no further batches will be assembled");
                if failure_policy == FailurePolicy::FailFast {
                    ctx.abort
                        .raise(AbortReason::SourceFailed(ErrorDetail::from_error(&e)));
                }
                return Err(e);
            }
            Some(Ok(batch)) => batch,
        };

        ctx.batches_assembled.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_batch_assembled(batch.len(), batch.metadata.input_bytes_in_batch);
        ctx.events.emit(RunEvent::BatchAssembled {
            batch_id: batch.id,
            items_in_batch: batch.metadata.items_in_batch,
            input_bytes_in_batch: batch.metadata.input_bytes_in_batch,
        });

        // Blocks while the queue is full; backpressure reaches the reader from here
        tokio::select! {
            biased;
            _ = ctx.abort.raised() => return Ok(()),
            sent = tx.send(batch) => {
                if sent.is_err() {
                    tracing::debug!("Dispatch queue closed, producer stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle on a spawned run.
pub struct RunHandle {
    ctx: Arc<RunContext>,
    join: JoinHandle<Result<RunResult>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.ctx.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.ctx.phase()
    }

    /// Wait until the run reaches `phase` or a terminal phase, returning the
    /// phase actually reached.
    pub async fn wait_for_phase(&self, phase: RunPhase) -> RunPhase {
        let mut rx = self.ctx.watch_phase();
        match rx.wait_for(|current| *current == phase || current.is_terminal()).await {
            Ok(reached) => *reached,
            Err(_) => self.ctx.phase(),
        }
    }

    /// Like [`RunHandle::wait_for_phase`] with an upper bound on the wait.
    pub async fn wait_for_phase_timeout(&self, phase: RunPhase, timeout: Duration) -> Option<RunPhase> {
        tokio::time::timeout(timeout, self.wait_for_phase(phase))
            .await
            .ok()
    }

    /// Live events from now on.
    pub fn subscribe(&self) -> EventStream {
        self.ctx.events.subscribe()
    }

    /// Every event emitted so far.
    pub fn history(&self) -> Vec<EventRecord> {
        self.ctx.events.history()
    }

    /// Ask the run to stop. Returns false if it was already aborting.
    pub fn abort(&self) -> bool {
        self.ctx.abort.raise(AbortReason::Cancelled)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunResult> {
        match self.join.await {
            Ok(result) => result,
            Err(join_error) => Err(VolleyError::Other(anyhow::anyhow!(
                "run task failed: {}",
                join_error
            ))),
        }
    }
}
