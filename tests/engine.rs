use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use volley::dispatch::{DispatchConfig, FailurePolicy};
use volley::invoker::{InvocationError, MockInvoker};
use volley::{
    AbortReason, BatchId, BatchingPolicy, Engine, EngineConfig, JsonLinesSource, MockItemSource,
    OutcomeStatus, ReaderConfig, RetryConfig, RunEvent, RunPhase, RunStatus, VolleyError,
};

fn items(count: usize) -> Arc<MockItemSource> {
    Arc::new(MockItemSource::from_values((0..count).map(|n| json!({"n": n}))))
}

fn dispatch(limit: usize, policy: FailurePolicy) -> DispatchConfig {
    DispatchConfig {
        concurrency_limit: Some(limit),
        failure_policy: policy,
        retry: RetryConfig {
            max_attempts: 3,
            backoff_ms: 5,
            backoff_factor: 2,
            max_backoff_ms: 20,
        },
        ..Default::default()
    }
}

fn config(max_items: usize, dispatch: DispatchConfig) -> EngineConfig {
    EngineConfig::new(ReaderConfig::new("mock://items"), BatchingPolicy::max_items(max_items))
        .with_dispatch(dispatch)
}

#[test_log::test(tokio::test)]
async fn test_fail_fast_stops_dispatch_after_failure() {
    // 10 batches of one item; batch 4 fails permanently, later batches never return
    let source = items(10);
    let invoker = Arc::new(MockInvoker::new());
    invoker.add_response(4, Err(InvocationError::NonRetryable("bad batch".into())));
    for id in 5..10u64 {
        invoker.add_hang(id);
    }

    let engine = Engine::new(config(1, dispatch(3, FailurePolicy::FailFast)), source, invoker.clone());
    let result = engine.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::FailFast { batch_id: BatchId(4) })
    );

    let failed = result.outcome(BatchId(4)).expect("batch 4 has an outcome");
    assert_eq!(failed.status(), OutcomeStatus::Failed);
    assert_eq!(failed.attempts, 1);

    // Nothing beyond the two batches that could have been in flight alongside batch 4
    for outcome in &result.outcomes {
        assert!(outcome.batch_id <= BatchId(4), "unexpected outcome {}", outcome.batch_id);
    }
    for id in &result.cancelled {
        assert!(*id <= BatchId(6), "unexpected cancellation {}", id);
    }
    assert!(invoker.calls().iter().all(|c| c.batch_id <= BatchId(6)));
    assert!(invoker.max_in_flight() <= 3);
}

#[test_log::test(tokio::test)]
async fn test_empty_source_succeeds_with_no_outcomes() {
    let engine = Engine::new(
        config(5, DispatchConfig::default()),
        items(0),
        Arc::new(MockInvoker::new()),
    );

    let result = engine.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert!(result.outcomes.is_empty());
    assert!(result.cancelled.is_empty());
    assert_eq!(result.stats.items_read, 0);
    assert_eq!(result.stats.batches_assembled, 0);
}

#[test_log::test(tokio::test)]
async fn test_outcomes_are_ordered_regardless_of_completion_order() {
    let source = items(6);
    let invoker = Arc::new(MockInvoker::new());

    // Release batches in reverse order
    let mut triggers = Vec::new();
    for id in 0..3u64 {
        triggers.push(invoker.add_response_with_trigger(id, Ok(json!({"batch": id}))));
    }

    let engine = Engine::new(config(2, dispatch(3, FailurePolicy::FailFast)), source, invoker.clone());
    let handle = engine.start();

    while invoker.in_flight_count() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for trigger in triggers.into_iter().rev() {
        trigger.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    let ids: Vec<BatchId> = result.outcomes.iter().map(|o| o.batch_id).collect();
    assert_eq!(ids, vec![BatchId(0), BatchId(1), BatchId(2)]);
    for (n, outcome) in result.outcomes.iter().enumerate() {
        assert_eq!(outcome.output(), Some(&json!({"batch": n})));
        assert_eq!(outcome.items_in_batch, 2);
    }
}

#[test_log::test(tokio::test)]
async fn test_rerun_is_deterministic() {
    let source = items(9);
    let invoker = Arc::new(MockInvoker::new());
    let engine = Engine::new(config(4, dispatch(2, FailurePolicy::FailFast)), source, invoker);

    let first = engine.run().await.unwrap();
    let second = engine.run().await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first, second);
    assert!(first.is_equivalent_to(&second));
    assert_eq!(first.outcomes.len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_best_effort_records_every_batch() {
    let source = items(8);
    let invoker = Arc::new(MockInvoker::new());
    invoker.add_response(1, Err(InvocationError::NonRetryable("rejected".into())));
    invoker.add_response(2, Err(InvocationError::Retryable("flaky".into())));

    let engine = Engine::new(config(2, dispatch(2, FailurePolicy::BestEffort)), source, invoker.clone());
    let result = engine.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.abort_reason.is_none());
    assert_eq!(result.outcomes.len(), 4);

    let statuses: Vec<OutcomeStatus> = result.outcomes.iter().map(|o| o.status()).collect();
    assert_eq!(
        statuses,
        vec![
            OutcomeStatus::Succeeded,
            OutcomeStatus::Failed,
            OutcomeStatus::Succeeded,
            OutcomeStatus::Succeeded,
        ]
    );
    assert_eq!(result.outcome(BatchId(2)).unwrap().attempts, 2);
    assert_eq!(result.stats.retries, 1);
    assert_eq!(result.stats.failed, 1);
    assert_eq!(invoker.attempts_for(1), 1);
}

#[test_log::test(tokio::test)]
async fn test_run_deadline_aborts() {
    let source = items(4);
    let invoker = Arc::new(MockInvoker::new());
    for id in 0..4u64 {
        invoker.add_hang(id);
    }

    let engine = Engine::new(
        config(1, dispatch(2, FailurePolicy::FailFast)).with_run_deadline_ms(100),
        source,
        invoker,
    );
    let result = engine.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::DeadlineExceeded { deadline_ms: 100 })
    );
    assert!(result.outcomes.is_empty());
    let cancelled: HashSet<BatchId> = result.cancelled.iter().copied().collect();
    assert_eq!(cancelled, HashSet::from([BatchId(0), BatchId(1)]));
}

#[test_log::test(tokio::test)]
async fn test_external_abort_through_handle() {
    let source = items(5);
    let invoker = Arc::new(MockInvoker::new());
    invoker.add_response(0, Ok(json!("done")));
    for id in 1..5u64 {
        invoker.add_hang(id);
    }

    let engine = Engine::new(config(1, dispatch(2, FailurePolicy::FailFast)), source, invoker.clone());
    let handle = engine.start();
    let mut events = handle.subscribe();

    // Abort once batch 0 is done and batch 1 is hanging
    let (mut finished_first, mut started_second) = (false, false);
    while let Some(record) = events.next().await {
        match record.event {
            RunEvent::BatchFinished { batch_id: BatchId(0), .. } => finished_first = true,
            RunEvent::BatchStarted { batch_id: BatchId(1), .. } => started_second = true,
            _ => {}
        }
        if finished_first && started_second {
            break;
        }
    }
    assert!(handle.abort());
    assert!(!handle.abort());

    let phase = handle.wait_for_phase(RunPhase::Completed).await;
    assert_eq!(phase, RunPhase::Aborted);

    let history = handle.history();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.abort_reason, Some(AbortReason::Cancelled));
    assert_eq!(result.outcomes.len(), 1);
    assert!(result.outcome(BatchId(0)).unwrap().is_success());
    assert!(!result.cancelled.is_empty());

    assert!(history.iter().any(|r| matches!(r.event, RunEvent::RunAborted { .. })));
    assert!(matches!(
        history.last().map(|r| &r.event),
        Some(RunEvent::RunFinished { status: RunStatus::Aborted })
    ));
}

#[test_log::test(tokio::test)]
async fn test_malformed_record_returns_partial_result() {
    let mut records: Vec<String> = (0..5).map(|n| json!({"n": n}).to_string()).collect();
    records.push("{not json".to_string());
    records.push(json!({"n": 6}).to_string());
    let source = Arc::new(MockItemSource::from_records(records));
    let invoker = Arc::new(MockInvoker::new());

    let engine = Engine::new(config(2, dispatch(2, FailurePolicy::BestEffort)), source, invoker);
    let err = engine.run().await.unwrap_err();
    assert!(err.is_reading_error());
    assert_eq!(err.partial_result().map(|r| r.outcomes.len()), Some(2));

    match err {
        VolleyError::ReadAborted { cause, partial } => {
            assert!(matches!(*cause, VolleyError::MalformedInput { index: 5, .. }));
            assert_eq!(partial.status, RunStatus::Aborted);
            assert!(matches!(partial.abort_reason, Some(AbortReason::SourceFailed(_))));
            // Item 4 was still in the accumulator and never dispatched
            let ids: Vec<BatchId> = partial.outcomes.iter().map(|o| o.batch_id).collect();
            assert_eq!(ids, vec![BatchId(0), BatchId(1)]);
            assert!(partial.outcomes.iter().all(|o| o.is_success()));
            assert_eq!(partial.stats.items_read, 5);
        }
        other => panic!("expected ReadAborted, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_undecodable_record_is_malformed_input() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{\"n\":0}\n\"\xff\xfe\"\n").unwrap();
    file.flush().unwrap();

    let mut config = EngineConfig::new(
        ReaderConfig::new(file.path().to_string_lossy().into_owned()),
        BatchingPolicy::max_items(1),
    )
    .with_dispatch(dispatch(1, FailurePolicy::BestEffort));
    config.reader.page_size = 1;

    let invoker = Arc::new(MockInvoker::new());
    let err = Engine::new(config, Arc::new(JsonLinesSource::new()), invoker.clone())
        .run()
        .await
        .unwrap_err();

    match err {
        VolleyError::ReadAborted { cause, partial } => {
            assert!(matches!(*cause, VolleyError::MalformedInput { index: 1, .. }));
            assert_eq!(partial.status, RunStatus::Aborted);
            assert_eq!(partial.stats.items_read, 1);
        }
        other => panic!("expected ReadAborted, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_timed_out_batch_trips_fail_fast() {
    let source = items(3);
    let invoker = Arc::new(MockInvoker::new());
    invoker.add_hang(0);

    let mut dispatch = dispatch(1, FailurePolicy::FailFast);
    dispatch.invocation_timeout_ms = Some(30);
    let result = Engine::new(config(1, dispatch), source, invoker.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::FailFast { batch_id: BatchId(0) })
    );
    assert_eq!(result.outcomes.len(), 1);
    let timed_out = &result.outcomes[0];
    assert_eq!(timed_out.status(), OutcomeStatus::TimedOut);
    assert_eq!(timed_out.attempts, 1);
    // Timeouts are not retried and batches 1 and 2 are never dispatched
    assert_eq!(invoker.call_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_source_failure_mid_stream_cancels_in_flight_under_fail_fast() {
    let source = items(6);
    source.fail_page(1, VolleyError::SourceUnavailable("connection reset".into()));
    let invoker = Arc::new(MockInvoker::new());
    for id in 0..6u64 {
        invoker.add_hang(id);
    }

    let mut config = config(1, dispatch(2, FailurePolicy::FailFast));
    config.reader.page_size = 2;
    let err = Engine::new(config, source.clone(), invoker.clone())
        .run()
        .await
        .unwrap_err();

    match err {
        VolleyError::ReadAborted { cause, partial } => {
            assert!(matches!(*cause, VolleyError::SourceUnavailable(_)));
            assert_eq!(partial.status, RunStatus::Aborted);
            assert!(matches!(partial.abort_reason, Some(AbortReason::SourceFailed(_))));
            assert!(partial.outcomes.is_empty());
            assert!(
                partial
                    .cancelled
                    .iter()
                    .all(|id| *id == BatchId(0) || *id == BatchId(1))
            );
        }
        other => panic!("expected ReadAborted, got {:?}", other),
    }

    assert_eq!(source.fetch_count(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(invoker.in_flight_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_unreachable_source_fails_before_dispatch() {
    let source = items(3);
    source.fail_page(0, VolleyError::SourceUnavailable("connection refused".into()));
    let invoker = Arc::new(MockInvoker::new());

    let engine = Engine::new(config(1, DispatchConfig::default()), source.clone(), invoker.clone());
    let handle = engine.start();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, VolleyError::SourceUnavailable(_)));
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(invoker.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_invalid_policy_never_reads() {
    let source = items(3);
    let engine = Engine::new(
        EngineConfig::new(ReaderConfig::new("mock://items"), BatchingPolicy::default()),
        source.clone(),
        Arc::new(MockInvoker::new()),
    );

    let handle = engine.start();
    let phase = handle.wait_for_phase(RunPhase::Dispatching).await;
    assert_eq!(phase, RunPhase::Aborted);
    assert!(matches!(
        handle.wait().await,
        Err(VolleyError::InvalidConfiguration(_))
    ));
    assert_eq!(source.fetch_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_max_items_truncates_run() {
    let source = items(100);
    let invoker = Arc::new(MockInvoker::new());
    let mut config = config(4, DispatchConfig::default());
    config.reader.max_items = Some(10);
    config.reader.page_size = 3;

    let result = Engine::new(config, source, invoker.clone()).run().await.unwrap();

    assert_eq!(result.stats.items_read, 10);
    let sizes: Vec<usize> = result.outcomes.iter().map(|o| o.items_in_batch).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    assert_eq!(invoker.call_count(), 3);
}

#[test_log::test(tokio::test)]
async fn test_json_lines_file_end_to_end() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for n in 0..7 {
        writeln!(file, "{}", json!({"id": n, "text": "x".repeat(n)})).unwrap();
    }
    file.flush().unwrap();

    let config = EngineConfig::from_json_str(&format!(
        r#"{{
            "reader": {{"source_locator": {path}, "page_size": 2}},
            "batching": {{"max_items_per_batch": 3, "extra_batch_input": {{"mode": "upper"}}}},
            "dispatch": {{"concurrency_limit": 2}}
        }}"#,
        path = json!(file.path().to_string_lossy())
    ))
    .unwrap();

    let invoker = Arc::new(MockInvoker::new());
    let engine = Engine::new(config, Arc::new(JsonLinesSource::new()), invoker.clone());
    let result = engine.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.stats.items_read, 7);
    assert_eq!(result.stats.batches_assembled, 3);

    let mut calls = invoker.calls();
    calls.sort_by_key(|c| c.batch_id);
    assert_eq!(calls[0].payload["batch_input"]["mode"], "upper");
    assert_eq!(calls[2].items_in_batch, 1);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_runs_are_independent() {
    let invoker = Arc::new(MockInvoker::new());
    let a = Engine::new(config(1, DispatchConfig::default()), items(3), invoker.clone());
    let b = Engine::new(config(2, DispatchConfig::default()), items(8), invoker.clone());

    let (ra, rb) = tokio::join!(a.run(), b.run());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_ne!(ra.run_id, rb.run_id);
    assert_eq!(ra.outcomes.len(), 3);
    assert_eq!(rb.outcomes.len(), 4);
    assert_eq!(ra.stats.items_read, 3);
    assert_eq!(rb.stats.items_read, 8);
}
