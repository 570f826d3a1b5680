//! Sub-execution invoker abstraction.
//!
//! The engine treats the unit of work run for each batch as an opaque
//! capability: [`SubExecutionInvoker::invoke`] takes a batch and either returns
//! a JSON result or one of the three failure classes the scheduler knows how
//! to handle. [`ReqwestInvoker`] posts batches to an HTTP endpoint;
//! [`MockInvoker`] scripts responses for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::domain::batch::{Batch, BatchId};

/// Failure classes an invocation can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    /// Transient failure, worth retrying after a backoff.
    #[error("retryable invocation failure: {0}")]
    Retryable(String),

    /// The batch itself is bad; retrying will not help.
    #[error("non-retryable invocation failure: {0}")]
    NonRetryable(String),

    /// The invocation did not finish within its deadline.
    #[error("invocation timed out: {0}")]
    Timeout(String),
}

impl InvocationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InvocationError::Retryable(_))
    }
}

pub type InvocationResult = std::result::Result<Value, InvocationError>;

/// Capability that runs one batch.
///
/// Implementations must be cheap to share: the scheduler holds the invoker in
/// an `Arc` and calls it from many tasks at once.
#[async_trait]
pub trait SubExecutionInvoker: Send + Sync + 'static {
    async fn invoke(&self, batch: &Batch) -> InvocationResult;
}

#[async_trait]
impl<T: SubExecutionInvoker + ?Sized> SubExecutionInvoker for Arc<T> {
    async fn invoke(&self, batch: &Batch) -> InvocationResult {
        (**self).invoke(batch).await
    }
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Predicate deciding whether an HTTP status should be retried.
pub type ShouldRetryFn = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Default retry predicate: retry on server errors (5xx), rate limits (429), and timeouts (408).
pub fn default_should_retry(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// Invoker that POSTs each batch payload as JSON to a fixed endpoint.
#[derive(Clone)]
pub struct ReqwestInvoker {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    should_retry: ShouldRetryFn,
}

impl ReqwestInvoker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
            should_retry: Arc::new(default_should_retry),
        }
    }

    /// Send `Authorization: Bearer <key>` with every invocation.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_should_retry(mut self, should_retry: ShouldRetryFn) -> Self {
        self.should_retry = should_retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify_transport_error(e: reqwest::Error) -> InvocationError {
        if e.is_timeout() {
            InvocationError::Timeout(e.to_string())
        } else if e.is_builder() {
            InvocationError::NonRetryable(format!("failed to build request: {}", e))
        } else {
            InvocationError::Retryable(e.to_string())
        }
    }
}

#[async_trait]
impl SubExecutionInvoker for ReqwestInvoker {
    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.id, items = batch.len()))]
    async fn invoke(&self, batch: &Batch) -> InvocationResult {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("x-volley-batch-id", batch.id.to_string())
            .json(&batch.payload());

        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "Invocation request failed");
            Self::classify_transport_error(e)
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(Self::classify_transport_error)?;

        tracing::debug!(status, response_len = body.len(), "Invocation response received");

        if (200..300).contains(&status) {
            // Non-JSON bodies are kept verbatim as a string result
            return Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)));
        }

        let message = format!("HTTP {}: {}", status, body);
        if (self.should_retry)(status) {
            Err(InvocationError::Retryable(message))
        } else {
            Err(InvocationError::NonRetryable(message))
        }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Invoker with scripted per-batch responses.
///
/// Responses for a batch are consumed in FIFO order, one per attempt. Once a
/// batch's queue is empty the fallback response is used, which defaults to
/// echoing the number of items in the batch.
#[derive(Clone, Default)]
pub struct MockInvoker {
    responses: Arc<Mutex<HashMap<BatchId, VecDeque<MockResponse>>>>,
    fallback: Arc<Mutex<Option<InvocationResult>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

enum MockResponse {
    Immediate(InvocationResult),
    /// Waits for the trigger to fire (or be dropped) before returning
    Triggered {
        response: InvocationResult,
        trigger: oneshot::Receiver<()>,
    },
    /// Never returns; only an abort ends it
    Hang,
}

/// Record of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub batch_id: BatchId,
    pub items_in_batch: usize,
    pub payload: Value,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next attempt on `batch_id`.
    pub fn add_response(&self, batch_id: impl Into<BatchId>, response: InvocationResult) -> &Self {
        self.push(batch_id.into(), MockResponse::Immediate(response));
        self
    }

    /// Queue a response that is held back until the returned sender fires.
    pub fn add_response_with_trigger(
        &self,
        batch_id: impl Into<BatchId>,
        response: InvocationResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            batch_id.into(),
            MockResponse::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    /// Make the next attempt on `batch_id` hang until it is aborted.
    pub fn add_hang(&self, batch_id: impl Into<BatchId>) -> &Self {
        self.push(batch_id.into(), MockResponse::Hang);
        self
    }

    /// Response used for batches with nothing scripted.
    pub fn set_fallback(&self, response: InvocationResult) {
        *self.fallback.lock() = Some(response);
    }

    fn push(&self, batch_id: BatchId, response: MockResponse) {
        self.responses
            .lock()
            .entry(batch_id)
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of invocations made for one batch.
    pub fn attempts_for(&self, batch_id: impl Into<BatchId>) -> usize {
        let batch_id = batch_id.into();
        self.calls
            .lock()
            .iter()
            .filter(|c| c.batch_id == batch_id)
            .count()
    }

    /// Invocations currently executing. Aborted invocations drop out of this.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent in-flight count observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubExecutionInvoker for MockInvoker {
    async fn invoke(&self, batch: &Batch) -> InvocationResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Decrement even if the task is aborted mid-await
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        self.calls.lock().push(MockCall {
            batch_id: batch.id,
            items_in_batch: batch.len(),
            payload: batch.payload(),
        });

        let scripted = self
            .responses
            .lock()
            .get_mut(&batch.id)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                let _ = trigger.await;
                response
            }
            Some(MockResponse::Hang) => std::future::pending().await,
            None => {
                let fallback = self.fallback.lock().clone();
                fallback.unwrap_or_else(|| Ok(serde_json::json!({ "processed": batch.len() })))
            }
        }
    }
}

struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::Item;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn batch(id: u64, n: u64) -> Batch {
        let items = (0..n).map(|i| Item::new(i, 1, json!(i))).collect();
        Batch::seal(BatchId(id), items, json!({"job": "test"}))
    }

    #[test]
    fn test_default_should_retry() {
        assert!(default_should_retry(500));
        assert!(default_should_retry(503));
        assert!(default_should_retry(429));
        assert!(default_should_retry(408));
        assert!(!default_should_retry(400));
        assert!(!default_should_retry(404));
    }

    #[tokio::test]
    async fn test_mock_responses_consumed_in_order() {
        let mock = MockInvoker::new();
        mock.add_response(0, Err(InvocationError::Retryable("blip".into())))
            .add_response(0, Ok(json!("done")));

        let b = batch(0, 2);
        assert!(mock.invoke(&b).await.unwrap_err().is_retryable());
        assert_eq!(mock.invoke(&b).await.unwrap(), json!("done"));
        // Fallback once the script runs out
        assert_eq!(mock.invoke(&b).await.unwrap(), json!({"processed": 2}));
        assert_eq!(mock.attempts_for(0), 3);
    }

    #[tokio::test]
    async fn test_mock_trigger_holds_response() {
        let mock = MockInvoker::new();
        let trigger = mock.add_response_with_trigger(1, Ok(json!("late")));

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move { mock_clone.invoke(&batch(1, 1)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), json!("late"));
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_in_flight_drops_on_abort() {
        let mock = MockInvoker::new();
        mock.add_hang(0);

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move { mock_clone.invoke(&batch(0, 1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.in_flight_count(), 1);

        handle.abort();
        let _ = handle.await;
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_reqwest_invoker_posts_payload() {
        let server = MockServer::start().await;
        let b = batch(3, 2);

        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(header("x-volley-batch-id", "3"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(b.payload()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let invoker = ReqwestInvoker::new(format!("{}/invoke", server.uri())).with_api_key("secret");
        assert_eq!(invoker.invoke(&b).await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_reqwest_invoker_keeps_non_json_body_as_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let invoker = ReqwestInvoker::new(server.uri());
        assert_eq!(invoker.invoke(&batch(0, 1)).await.unwrap(), json!("plain text"));
    }

    #[tokio::test]
    async fn test_reqwest_invoker_classifies_statuses() {
        let server = MockServer::start().await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        Mock::given(path("/bad"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid items"))
            .mount(&server)
            .await;

        let busy = ReqwestInvoker::new(format!("{}/busy", server.uri()));
        match busy.invoke(&batch(0, 1)).await {
            Err(InvocationError::Retryable(msg)) => assert!(msg.contains("503")),
            other => panic!("expected Retryable, got {:?}", other),
        }

        let bad = ReqwestInvoker::new(format!("{}/bad", server.uri()));
        match bad.invoke(&batch(0, 1)).await {
            Err(InvocationError::NonRetryable(msg)) => assert!(msg.contains("invalid items")),
            other => panic!("expected NonRetryable, got {:?}", other),
        }

        // Custom predicate can make 422 retryable
        let lenient = ReqwestInvoker::new(format!("{}/bad", server.uri()))
            .with_should_retry(Arc::new(|status| status == 422));
        assert!(lenient.invoke(&batch(0, 1)).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_reqwest_invoker_client_timeout_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let invoker = ReqwestInvoker::with_client(client, server.uri());
        assert!(matches!(
            invoker.invoke(&batch(0, 1)).await,
            Err(InvocationError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_reqwest_invoker_connection_refused_is_retryable() {
        // Port 1 on localhost is reserved and not listening
        let invoker = ReqwestInvoker::new("http://127.0.0.1:1/invoke");
        assert!(invoker.invoke(&batch(0, 1)).await.unwrap_err().is_retryable());
    }
}
