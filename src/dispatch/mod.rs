//! Bounded-concurrency dispatch of assembled batches.
//!
//! The [`Scheduler`] pulls batches from a bounded queue in BatchId order and
//! drives each one through the dispatch lifecycle on its own worker task.
//! A semaphore permit is taken *before* a batch is pulled, so at most
//! `concurrency_limit` batches are ever out of the queue and unfinished.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregator::OutcomeCollector;
use crate::domain::batch::{Batch, BatchId};
use crate::domain::dispatch::{Dispatch, DispatchCompletion, Queued, RetryConfig};
use crate::domain::outcome::{AbortReason, ExecutionOutcome};
use crate::error::{Result, VolleyError};
use crate::events::{EventFeed, RunEvent};
use crate::invoker::SubExecutionInvoker;

/// Concurrency limit used when none is configured.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// Default depth of the queue between the assembler and the workers.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// What a failed or timed-out batch does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the run on the first Failed or TimedOut outcome.
    #[default]
    FailFast,
    /// Run every batch regardless of individual failures.
    BestEffort,
}

/// Configuration for the dispatch scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum batches in flight at once. Defaults to [`DEFAULT_CONCURRENCY_LIMIT`].
    pub concurrency_limit: Option<usize>,

    pub failure_policy: FailurePolicy,

    pub retry: RetryConfig,

    /// Deadline for each individual invocation attempt in milliseconds
    pub invocation_timeout_ms: Option<u64>,

    /// Assembled batches buffered ahead of the workers
    pub queue_depth: usize,

    /// Interval for logging dispatch status (batches in flight) in milliseconds.
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            failure_policy: FailurePolicy::FailFast,
            retry: RetryConfig::default(),
            invocation_timeout_ms: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            status_log_interval_ms: None,
        }
    }
}

impl DispatchConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT)
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "concurrency_limit must be positive".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(VolleyError::InvalidConfiguration(
                "queue_depth must be positive".to_string(),
            ));
        }
        if self.invocation_timeout_ms == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "invocation_timeout_ms must be positive when set".to_string(),
            ));
        }
        if self.status_log_interval_ms == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "status_log_interval_ms must be positive when set".to_string(),
            ));
        }
        self.retry.validate()
    }
}

impl From<&DispatchConfig> for RetryConfig {
    fn from(config: &DispatchConfig) -> Self {
        config.retry.clone()
    }
}

/// Run-wide abort flag with the reason that raised it.
///
/// The first reason raised wins; later raises are ignored.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal tied to a parent token: cancelling the parent aborts this too.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::default(),
        }
    }

    /// Raise the abort. Returns false if it was already raised, including by
    /// cancellation of the parent token, which then records `Cancelled`.
    pub fn raise(&self, reason: AbortReason) -> bool {
        {
            let mut current = self.reason.lock();
            if current.is_some() {
                return false;
            }
            if self.token.is_cancelled() {
                *current = Some(AbortReason::Cancelled);
                return false;
            }
            tracing::warn!(reason = %reason, "Run abort raised");
            *current = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason. A parent cancellation with no explicit reason
    /// reads as `Cancelled`.
    pub fn reason(&self) -> Option<AbortReason> {
        let recorded = self.reason.lock().clone();
        recorded.or_else(|| self.is_raised().then_some(AbortReason::Cancelled))
    }

    pub async fn raised(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Counters reported when the scheduler finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches_dispatched: u64,
    pub retries: u64,
    pub peak_in_flight: usize,
}

/// State shared by every worker of one scheduler run.
struct WorkerContext<I> {
    invoker: Arc<I>,
    collector: Arc<OutcomeCollector>,
    events: Arc<EventFeed>,
    abort: AbortSignal,
    retry_config: RetryConfig,
    timeout: Option<Duration>,
    failure_policy: FailurePolicy,
    retries: AtomicU64,
}

/// Worker pool that dispatches batches to a sub-execution invoker.
pub struct Scheduler<I: SubExecutionInvoker> {
    config: DispatchConfig,
    invoker: Arc<I>,
    collector: Arc<OutcomeCollector>,
    events: Arc<EventFeed>,
    abort: AbortSignal,
    batches_in_flight: Arc<AtomicUsize>,
}

impl<I: SubExecutionInvoker> Scheduler<I> {
    pub fn new(
        config: DispatchConfig,
        invoker: Arc<I>,
        collector: Arc<OutcomeCollector>,
        events: Arc<EventFeed>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            config,
            invoker,
            collector,
            events,
            abort,
            batches_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared handle on the in-flight batch counter.
    pub fn batches_in_flight(&self) -> Arc<AtomicUsize> {
        self.batches_in_flight.clone()
    }

    /// Dispatch batches until the queue closes or the run is aborted.
    ///
    /// Returns once every dispatched batch has an outcome or has been
    /// cancelled. Batches still in the queue after an abort are never
    /// dispatched.
    #[tracing::instrument(skip_all, fields(concurrency = self.config.effective_concurrency(), policy = ?self.config.failure_policy))]
    pub async fn run(self, mut batches: mpsc::Receiver<Batch>) -> DispatchSummary {
        let concurrency = self.config.effective_concurrency();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let status_stop = CancellationToken::new();
        let peak_in_flight = Arc::new(AtomicUsize::new(0));

        let ctx = Arc::new(WorkerContext {
            invoker: self.invoker.clone(),
            collector: self.collector.clone(),
            events: self.events.clone(),
            abort: self.abort.clone(),
            retry_config: (&self.config).into(),
            timeout: self.config.invocation_timeout(),
            failure_policy: self.config.failure_policy,
            retries: AtomicU64::new(0),
        });

        // Spawn periodic status logging if configured
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let batches_in_flight = self.batches_in_flight.clone();
            let stop = status_stop.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let count = batches_in_flight.load(Ordering::Relaxed);
                            tracing::debug!(batches_in_flight = count, "Dispatch status");
                        }
                        _ = stop.cancelled() => break,
                    }
                }
            });
        }

        tracing::info!("Scheduler started");

        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut dispatched: u64 = 0;

        loop {
            // Reap finished workers (non-blocking)
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Worker task panicked");
                }
            }

            // Capacity first, then the next batch, so pulls stay in BatchId order
            let permit = tokio::select! {
                biased;
                _ = self.abort.raised() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let batch = tokio::select! {
                biased;
                _ = self.abort.raised() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        tracing::debug!("Batch queue closed");
                        break;
                    }
                },
            };

            dispatched += 1;
            let batch_id = batch.id;
            let batches_in_flight = self.batches_in_flight.clone();
            let now_in_flight = batches_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
            peak_in_flight.fetch_max(now_in_flight, Ordering::Relaxed);
            crate::metrics::set_batches_in_flight(now_in_flight);

            tracing::debug!(batch_id = %batch_id, items = batch.len(), in_flight = now_in_flight, "Acquired permit, spawning worker");

            let ctx = ctx.clone();
            join_set.spawn(async move {
                // Permit is held for the duration of this task
                let _permit = permit;

                // Ensure we decrement the counter when this task completes
                let _guard = scopeguard::guard((), |_| {
                    let remaining = batches_in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
                    crate::metrics::set_batches_in_flight(remaining);
                });

                drive_batch(Arc::new(batch), &ctx).await;
            });
        }

        if self.abort.is_raised() {
            tracing::info!(
                in_flight = self.batches_in_flight.load(Ordering::Relaxed),
                "Abort raised, no further batches will be dispatched"
            );
        }

        // Drop the receiver so a blocked producer observes the closed queue
        drop(batches);

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Worker task panicked");
            }
        }
        status_stop.cancel();

        let summary = DispatchSummary {
            batches_dispatched: dispatched,
            retries: ctx.retries.load(Ordering::Relaxed),
            peak_in_flight: peak_in_flight.load(Ordering::Relaxed),
        };
        tracing::info!(
            batches_dispatched = summary.batches_dispatched,
            retries = summary.retries,
            peak_in_flight = summary.peak_in_flight,
            "Scheduler finished"
        );
        summary
    }
}

/// Drive one batch to an outcome, retrying as configured.
async fn drive_batch<I: SubExecutionInvoker>(batch: Arc<Batch>, ctx: &WorkerContext<I>) {
    let batch_id = batch.id;
    let mut queued = Dispatch::<Queued>::new(batch);

    loop {
        if let Some(backoff) = queued.state.backoff {
            tokio::select! {
                biased;
                _ = ctx.abort.raised() => {
                    finish_cancelled(ctx, batch_id);
                    return;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        if ctx.abort.is_raised() {
            let _cancelled = queued.cancel();
            finish_cancelled(ctx, batch_id);
            return;
        }

        ctx.events.emit(RunEvent::BatchStarted {
            batch_id,
            attempt: queued.state.attempts + 1,
        });

        let in_flight = queued.start(ctx.invoker.clone(), ctx.timeout);
        let completion = in_flight.complete(ctx.abort.raised()).await;

        match completion {
            DispatchCompletion::Succeeded(done) => {
                tracing::info!(batch_id = %batch_id, attempts = done.state.attempts, "Batch completed successfully");
                finish_with_outcome(ctx, done.into_outcome());
                return;
            }
            DispatchCompletion::TimedOut(timed_out) => {
                tracing::warn!(batch_id = %batch_id, attempts = timed_out.state.attempts, error = %timed_out.state.message, "Batch timed out");
                finish_with_outcome(ctx, timed_out.into_outcome());
                return;
            }
            DispatchCompletion::Cancelled(_cancelled) => {
                finish_cancelled(ctx, batch_id);
                return;
            }
            DispatchCompletion::Failed(failed) => {
                let error = failed.state.reason.to_error_message();
                let retriable = failed.state.reason.is_retriable();

                match failed.can_retry(&ctx.retry_config) {
                    Ok(requeued) => {
                        ctx.retries.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_retry("retryable");
                        ctx.events.emit(RunEvent::BatchRetryScheduled {
                            batch_id,
                            next_attempt: requeued.state.attempts + 1,
                            backoff_ms: requeued.state.backoff.unwrap_or_default().as_millis() as u64,
                            error,
                        });
                        queued = requeued;
                    }
                    Err(failed) => {
                        if retriable {
                            tracing::warn!(batch_id = %batch_id, attempts = failed.state.attempts, error = %error, "Batch failed permanently (no attempts remaining)");
                        } else {
                            tracing::warn!(batch_id = %batch_id, error = %error, "Batch failed with non-retryable error, not retrying");
                        }
                        finish_with_outcome(ctx, failed.into_outcome());
                        return;
                    }
                }
            }
        }
    }
}

fn finish_with_outcome<I>(ctx: &WorkerContext<I>, outcome: ExecutionOutcome) {
    let batch_id = outcome.batch_id;
    let status = outcome.status();
    let attempts = outcome.attempts;
    let duration = (outcome.finished_at - outcome.started_at)
        .to_std()
        .unwrap_or_default();

    if !ctx.collector.record(outcome) {
        return;
    }
    crate::metrics::record_batch_outcome(status, duration);
    ctx.events.emit(RunEvent::BatchFinished {
        batch_id,
        status,
        attempts,
    });

    if status.is_failure() && ctx.failure_policy == FailurePolicy::FailFast {
        ctx.abort.raise(AbortReason::FailFast { batch_id });
    }
}

fn finish_cancelled<I>(ctx: &WorkerContext<I>, batch_id: BatchId) {
    tracing::debug!(batch_id = %batch_id, "Batch cancelled by abort");
    if ctx.collector.record_cancelled(batch_id) {
        crate::metrics::record_batch_cancelled();
        ctx.events.emit(RunEvent::BatchCancelled { batch_id });
    }
}
