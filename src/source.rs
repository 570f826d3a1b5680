//! Item source abstraction for pulling raw records in pages.
//!
//! This module defines the `ItemSource` trait to abstract the external store
//! items are read from, enabling testability with scripted implementations.
//! Sources return raw records; parsing them into items is the reader's job.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::error::{Result, VolleyError};

/// Where the items live (path, URL, object key; interpreted by the source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocator(pub String);

impl From<&str> for SourceLocator {
    fn from(s: &str) -> Self {
        SourceLocator(s.to_string())
    }
}

impl From<String> for SourceLocator {
    fn from(s: String) -> Self {
        SourceLocator(s)
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque continuation token handed back by a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub String);

/// Parameters for fetching one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Token from the previous page; `None` for the first page
    pub page_token: Option<PageToken>,
    /// Maximum records to return in this page
    pub max_items: usize,
    /// Remaining overall item budget. Only passed to sources that report
    /// `supports_item_limit()`.
    pub item_limit: Option<u64>,
}

/// One page of raw records.
///
/// Records are raw bytes; decoding and parsing is left to the reader so a
/// bad record is reported against its item index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<Vec<u8>>,
    /// `None` once the sequence is exhausted
    pub next_page_token: Option<PageToken>,
}

/// Trait for fetching pages of raw records from an external store.
///
/// # Errors
/// Implementations return `SourceUnavailable` when the store cannot be
/// reached. Any other error is treated the same way by the reader.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Fetch one page of records.
    async fn fetch_page(&self, locator: &SourceLocator, request: PageRequest) -> Result<Page>;

    /// Whether the source can stop early given an overall item limit.
    fn supports_item_limit(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: ItemSource + ?Sized> ItemSource for Arc<T> {
    async fn fetch_page(&self, locator: &SourceLocator, request: PageRequest) -> Result<Page> {
        (**self).fetch_page(locator, request).await
    }

    fn supports_item_limit(&self) -> bool {
        (**self).supports_item_limit()
    }
}

// ============================================================================
// JSON-lines file implementation
// ============================================================================

/// Reads a local JSON-lines file, one record per non-blank line.
///
/// The locator is the file path, resolved against an optional root. Page
/// tokens are byte offsets into the file.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesSource {
    root: Option<PathBuf>,
}

impl JsonLinesSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locators against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, locator: &SourceLocator) -> PathBuf {
        match &self.root {
            Some(root) => root.join(&locator.0),
            None => PathBuf::from(&locator.0),
        }
    }
}

#[async_trait]
impl ItemSource for JsonLinesSource {
    #[tracing::instrument(skip(self, locator, request), fields(locator = %locator, token = ?request.page_token))]
    async fn fetch_page(&self, locator: &SourceLocator, request: PageRequest) -> Result<Page> {
        let path = self.resolve(locator);
        let offset = match &request.page_token {
            Some(token) => token.0.parse::<u64>().map_err(|e| {
                VolleyError::SourceUnavailable(format!("Invalid page token '{}': {}", token.0, e))
            })?,
            None => 0,
        };

        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            VolleyError::SourceUnavailable(format!("Failed to open {}: {}", path.display(), e))
        })?;
        file.seek(SeekFrom::Start(offset)).await?;

        let limit = match request.item_limit {
            Some(remaining) => request.max_items.min(remaining as usize),
            None => request.max_items,
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::with_capacity(limit);
        let mut position = offset;
        let mut line = Vec::new();
        let mut exhausted = false;

        while records.len() < limit {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                exhausted = true;
                break;
            }
            position += read as u64;
            let record = line.trim_ascii_end();
            if record.is_empty() {
                continue;
            }
            records.push(record.to_vec());
        }

        // Peek so a page ending exactly at EOF does not hand out a dead token
        if !exhausted && reader.fill_buf().await?.is_empty() {
            exhausted = true;
        }

        tracing::debug!(
            path = %path.display(),
            records = records.len(),
            next_offset = position,
            exhausted,
            "Fetched page"
        );

        Ok(Page {
            records,
            next_page_token: (!exhausted && limit > 0).then(|| PageToken(position.to_string())),
        })
    }

    fn supports_item_limit(&self) -> bool {
        true
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Scripted item source for tests.
///
/// Records are split into pages of whatever size the reader asks for.
/// Failures can be injected for a given page number (0-based).
///
/// # Example
/// ```ignore
/// let source = MockItemSource::from_records(vec![r#"{"n":1}"#.to_string()]);
/// source.fail_page(0, VolleyError::SourceUnavailable("down".into()));
/// ```
#[derive(Clone, Default)]
pub struct MockItemSource {
    records: Arc<Vec<String>>,
    failures: Arc<Mutex<HashMap<usize, VecDeque<VolleyError>>>>,
    requests: Arc<Mutex<Vec<PageRequest>>>,
    fetches: Arc<AtomicUsize>,
    native_limit: bool,
}

impl MockItemSource {
    pub fn from_records(records: Vec<String>) -> Self {
        Self {
            records: Arc::new(records),
            ..Default::default()
        }
    }

    /// Records are the JSON renderings of the given values.
    pub fn from_values(values: impl IntoIterator<Item = serde_json::Value>) -> Self {
        Self::from_records(values.into_iter().map(|v| v.to_string()).collect())
    }

    /// Honour `PageRequest::item_limit` like a store with native limit support.
    pub fn with_native_limit(mut self) -> Self {
        self.native_limit = true;
        self
    }

    /// Make the next fetch of `page` fail with `error`.
    pub fn fail_page(&self, page: usize, error: VolleyError) {
        self.failures.lock().entry(page).or_default().push_back(error);
    }

    /// Number of fetches made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Every page request seen, in order.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ItemSource for MockItemSource {
    async fn fetch_page(&self, _locator: &SourceLocator, request: PageRequest) -> Result<Page> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let start = match &request.page_token {
            Some(token) => token
                .0
                .parse::<usize>()
                .map_err(|e| VolleyError::SourceUnavailable(format!("bad token: {}", e)))?,
            None => 0,
        };

        let page_number = if request.max_items == 0 {
            0
        } else {
            start / request.max_items
        };
        let injected = self
            .failures
            .lock()
            .get_mut(&page_number)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = injected {
            return Err(error);
        }

        let mut take = request.max_items;
        if self.native_limit
            && let Some(remaining) = request.item_limit
        {
            take = take.min(remaining as usize);
        }

        let end = (start + take).min(self.records.len());
        let records = self.records[start.min(end)..end]
            .iter()
            .map(|record| record.clone().into_bytes())
            .collect();
        let next_page_token = (end < self.records.len() && take > 0).then(|| PageToken(end.to_string()));

        Ok(Page {
            records,
            next_page_token,
        })
    }

    fn supports_item_limit(&self) -> bool {
        self.native_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn text(page: &Page) -> Vec<String> {
        page.records
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect()
    }

    fn request(token: Option<&str>, max_items: usize) -> PageRequest {
        PageRequest {
            page_token: token.map(|t| PageToken(t.to_string())),
            max_items,
            item_limit: None,
        }
    }

    #[tokio::test]
    async fn test_json_lines_pages_through_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"n":0}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"n":1}}"#).unwrap();
        writeln!(file, r#"{{"n":2}}"#).unwrap();
        file.flush().unwrap();

        let source = JsonLinesSource::new();
        let locator = SourceLocator(file.path().display().to_string());

        let first = source.fetch_page(&locator, request(None, 2)).await.unwrap();
        assert_eq!(text(&first), vec![r#"{"n":0}"#, r#"{"n":1}"#]);
        let token = first.next_page_token.expect("more records remain");

        let second = source
            .fetch_page(&locator, request(Some(&token.0), 2))
            .await
            .unwrap();
        assert_eq!(text(&second), vec![r#"{"n":2}"#]);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_json_lines_exact_page_boundary_has_no_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1").unwrap();
        writeln!(file, "2").unwrap();
        file.flush().unwrap();

        let source = JsonLinesSource::new();
        let locator = SourceLocator(file.path().display().to_string());
        let page = source.fetch_page(&locator, request(None, 2)).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_json_lines_passes_undecodable_bytes_through() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"n\":0}\r\n\"\xff\xfe\"\n").unwrap();
        file.flush().unwrap();

        let source = JsonLinesSource::new();
        let locator = SourceLocator(file.path().display().to_string());
        let page = source.fetch_page(&locator, request(None, 10)).await.unwrap();
        assert_eq!(page.records, vec![b"{\"n\":0}".to_vec(), b"\"\xff\xfe\"".to_vec()]);
    }

    #[tokio::test]
    async fn test_json_lines_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonLinesSource::with_root(dir.path());
        let err = source
            .fetch_page(&SourceLocator::from("missing.jsonl"), request(None, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_json_lines_honours_item_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(file, "{}", i).unwrap();
        }
        file.flush().unwrap();

        let source = JsonLinesSource::new();
        let locator = SourceLocator(file.path().display().to_string());
        let page = source
            .fetch_page(
                &locator,
                PageRequest {
                    page_token: None,
                    max_items: 10,
                    item_limit: Some(3),
                },
            )
            .await
            .unwrap();
        assert_eq!(text(&page), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_mock_source_pages_and_failures() {
        let source = MockItemSource::from_values((0..5).map(|n| serde_json::json!(n)));
        source.fail_page(1, VolleyError::SourceUnavailable("flaky".to_string()));
        let locator = SourceLocator::from("mock");

        let first = source.fetch_page(&locator, request(None, 2)).await.unwrap();
        assert_eq!(text(&first), vec!["0", "1"]);

        let token = first.next_page_token.unwrap();
        let err = source
            .fetch_page(&locator, request(Some(&token.0), 2))
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::SourceUnavailable(_)));

        // Injected failures are consumed
        let second = source
            .fetch_page(&locator, request(Some(&token.0), 2))
            .await
            .unwrap();
        assert_eq!(text(&second), vec!["2", "3"]);
        assert_eq!(source.fetch_count(), 3);
    }
}
