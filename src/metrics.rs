//! Metrics for volley runs.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the host application. Without a recorder every call is a no-op.
//!
//! Metrics are organized into three categories:
//! - **Gauges**: Point-in-time state (batches in flight)
//! - **Counters**: Cumulative totals (items read, batches by status, retries, runs)
//! - **Histograms**: Distributions (batch and run duration, batch size)

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::domain::outcome::{OutcomeStatus, RunStatus};

pub fn record_items_read(count: u64) {
    counter!("volley_items_read_total").increment(count);
}

pub fn record_batch_assembled(items_in_batch: usize, input_bytes: u64) {
    counter!("volley_batches_assembled_total").increment(1);
    histogram!("volley_batch_items").record(items_in_batch as f64);
    histogram!("volley_batch_input_bytes").record(input_bytes as f64);
}

pub fn set_batches_in_flight(count: usize) {
    gauge!("volley_batches_in_flight").set(count as f64);
}

/// Record a batch reaching a terminal outcome.
pub fn record_batch_outcome(status: OutcomeStatus, duration: Duration) {
    counter!("volley_batches_total", "status" => status.as_str()).increment(1);
    histogram!("volley_batch_duration_seconds", "status" => status.as_str())
        .record(duration.as_secs_f64());
}

pub fn record_batch_cancelled() {
    counter!("volley_batches_total", "status" => "cancelled").increment(1);
}

pub fn record_retry(reason: &'static str) {
    counter!("volley_batch_retries_total", "reason" => reason).increment(1);
}

pub fn record_run_finished(status: RunStatus, duration: Duration) {
    counter!("volley_runs_total", "status" => status.as_str()).increment(1);
    histogram!("volley_run_duration_seconds", "status" => status.as_str())
        .record(duration.as_secs_f64());
}
