//! State transitions for batch dispatch using the typestate pattern.
//!
//! ```text
//! Dispatch<Queued> ──start()──> Dispatch<InFlight> ──complete()──> Dispatch<Succeeded>
//!       │                              │                       ──> Dispatch<Failed>
//!       │                              │                       ──> Dispatch<TimedOut>
//!       └──cancel()──> Cancelled       └──cancel()─────────────> Dispatch<Cancelled>
//!
//! Dispatch<Failed> ──can_retry()──> Ok(Dispatch<Queued>)   (retriable, attempts remain)
//!                                   Err(Dispatch<Failed>)  (otherwise)
//! ```
//!
//! Retries use exponential backoff: the n-th retry (0-based) waits
//! `backoff_ms * backoff_factor^n`, capped at `max_backoff_ms`.
//!
//! ```rust
//! # use volley::domain::dispatch::RetryConfig;
//! let config = RetryConfig {
//!     max_attempts: 4,        // first attempt plus up to three retries
//!     backoff_ms: 500,        // 0.5s, 1s, 2s
//!     backoff_factor: 2,
//!     max_backoff_ms: 30_000,
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::domain::batch::Batch;
use crate::error::{Result, VolleyError};
use crate::invoker::{InvocationError, SubExecutionInvoker};

use super::state::{
    Cancelled, Dispatch, DispatchCompletion, Failed, FailureReason, InFlight, Queued, Succeeded,
    TimedOut,
};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts allowed per batch, including the first
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds
    pub backoff_ms: u64,

    /// Factor by which the backoff grows with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// No retries: every failure is final.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(VolleyError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_factor == 0 {
            return Err(VolleyError::InvalidConfiguration(
                "retry.backoff_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `retry_attempt` (0-based).
    pub fn backoff_for(&self, retry_attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry_attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

impl Dispatch<Queued> {
    pub fn new(batch: Arc<Batch>) -> Self {
        Dispatch {
            batch,
            state: Queued {
                attempts: 0,
                backoff: None,
                first_started_at: None,
            },
        }
    }

    /// Spawn the next invocation attempt.
    ///
    /// The invocation runs in its own task so it can be aborted on timeout or
    /// cancellation without the invoker's cooperation.
    pub fn start<I: SubExecutionInvoker>(
        self,
        invoker: Arc<I>,
        timeout: Option<Duration>,
    ) -> Dispatch<InFlight> {
        let (tx, rx) = oneshot::channel();
        let batch = self.batch.clone();

        let task_handle = tokio::spawn(async move {
            let result = invoker.invoke(&batch).await;
            let _ = tx.send(result); // Receiver gone means the dispatch was abandoned
        });

        let now = chrono::Utc::now();
        let attempt = self.state.attempts + 1;

        tracing::debug!(batch_id = %self.batch.id, attempt, "Invocation started");

        Dispatch {
            batch: self.batch,
            state: InFlight {
                attempt,
                first_started_at: self.state.first_started_at.unwrap_or(now),
                started_at: now,
                deadline: timeout.map(|t| tokio::time::Instant::now() + t),
                timeout,
                result_rx: rx,
                abort_handle: task_handle.abort_handle(),
            },
        }
    }

    pub fn cancel(self) -> Dispatch<Cancelled> {
        Dispatch {
            batch: self.batch,
            state: Cancelled {
                attempts: self.state.attempts,
                cancelled_at: chrono::Utc::now(),
            },
        }
    }
}

impl Dispatch<Failed> {
    /// Attempt to retry this failed dispatch.
    ///
    /// Succeeds with a `Queued` dispatch carrying the backoff to wait when the
    /// failure is retriable and attempts remain; otherwise hands the failed
    /// dispatch back unchanged.
    pub fn can_retry(self, config: &RetryConfig) -> std::result::Result<Dispatch<Queued>, Box<Self>> {
        if !self.state.reason.is_retriable() {
            return Err(Box::new(self));
        }

        let attempts = self.state.attempts;
        if attempts >= config.max_attempts {
            counter!("volley_retry_denied_total", "reason" => "max_attempts").increment(1);
            tracing::debug!(
                batch_id = %self.batch.id,
                attempts,
                max_attempts = config.max_attempts,
                "No attempts remaining, batch remains failed"
            );
            return Err(Box::new(self));
        }

        let backoff = config.backoff_for(attempts.saturating_sub(1));

        tracing::info!(
            batch_id = %self.batch.id,
            attempt = attempts + 1,
            backoff_ms = backoff.as_millis() as u64,
            error = %self.state.reason.to_error_message(),
            "Retrying failed batch with exponential backoff"
        );

        Ok(Dispatch {
            batch: self.batch,
            state: Queued {
                attempts,
                backoff: Some(backoff),
                first_started_at: Some(self.state.started_at),
            },
        })
    }
}

impl Dispatch<InFlight> {
    /// Wait for the in-flight attempt to finish.
    ///
    /// Resolves to `TimedOut` when the per-attempt deadline passes first, and
    /// to `Cancelled` when `cancellation` resolves first. In both cases the
    /// invocation task is aborted. A result that is already available wins
    /// over a simultaneous deadline or cancellation.
    pub async fn complete<Fut>(mut self, cancellation: Fut) -> DispatchCompletion
    where
        Fut: Future<Output = ()>,
    {
        enum Outcome {
            Result(std::result::Result<crate::invoker::InvocationResult, oneshot::error::RecvError>),
            Elapsed,
            Cancelled,
        }

        let deadline = self.state.deadline;
        let elapsed = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            result = &mut self.state.result_rx => Outcome::Result(result),
            _ = elapsed => Outcome::Elapsed,
            _ = cancellation => Outcome::Cancelled,
        };

        let now = chrono::Utc::now();
        let attempts = self.state.attempt;
        let started_at = self.state.first_started_at;

        match outcome {
            Outcome::Cancelled => DispatchCompletion::Cancelled(self.cancel()),
            Outcome::Elapsed => {
                self.state.abort_handle.abort();
                let timeout_ms = self.state.timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                tracing::warn!(batch_id = %self.batch.id, attempt = attempts, timeout_ms, "Invocation exceeded its deadline, aborting");
                DispatchCompletion::TimedOut(Dispatch {
                    batch: self.batch,
                    state: TimedOut {
                        message: format!("invocation exceeded deadline of {}ms", timeout_ms),
                        attempts,
                        started_at,
                        timed_out_at: now,
                    },
                })
            }
            Outcome::Result(Ok(Ok(output))) => DispatchCompletion::Succeeded(Dispatch {
                batch: self.batch,
                state: Succeeded {
                    output,
                    attempts,
                    started_at,
                    finished_at: now,
                },
            }),
            Outcome::Result(Ok(Err(InvocationError::Timeout(message)))) => {
                DispatchCompletion::TimedOut(Dispatch {
                    batch: self.batch,
                    state: TimedOut {
                        message,
                        attempts,
                        started_at,
                        timed_out_at: now,
                    },
                })
            }
            Outcome::Result(Ok(Err(error))) => {
                let reason = match error {
                    InvocationError::Retryable(error) => FailureReason::Retryable { error },
                    InvocationError::NonRetryable(error) | InvocationError::Timeout(error) => {
                        FailureReason::NonRetryable { error }
                    }
                };
                DispatchCompletion::Failed(Dispatch {
                    batch: self.batch,
                    state: Failed {
                        reason,
                        attempts,
                        started_at,
                        failed_at: now,
                    },
                })
            }
            Outcome::Result(Err(_)) => {
                // Sender dropped without a result: the invocation task panicked
                tracing::error!(batch_id = %self.batch.id, attempt = attempts, "Invocation task terminated without a result");
                DispatchCompletion::Failed(Dispatch {
                    batch: self.batch,
                    state: Failed {
                        reason: FailureReason::TaskTerminated,
                        attempts,
                        started_at,
                        failed_at: now,
                    },
                })
            }
        }
    }

    /// Abort the in-flight invocation.
    pub fn cancel(self) -> Dispatch<Cancelled> {
        self.state.abort_handle.abort();
        tracing::debug!(batch_id = %self.batch.id, attempt = self.state.attempt, "Invocation cancelled");
        Dispatch {
            batch: self.batch,
            state: Cancelled {
                attempts: self.state.attempt,
                cancelled_at: chrono::Utc::now(),
            },
        }
    }
}
