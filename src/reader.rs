//! Lazy, page-buffered item stream over an [`ItemSource`].
//!
//! The reader hides paging from the rest of the engine: it fetches a page,
//! yields its records one parsed [`Item`] at a time, and only asks the source
//! for the next page once the current one is drained. The stream is finite
//! and cannot be restarted; the first error ends it.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::domain::item::Item;
use crate::error::{Result, VolleyError};
use crate::source::{ItemSource, Page, PageRequest, PageToken, SourceLocator};

/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Stream of parsed items.
pub type ItemStream = Pin<Box<dyn Stream<Item = Result<Item>> + Send>>;

/// Configuration for reading the item source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Where to read items from
    pub source_locator: SourceLocator,

    /// Cap on the total number of items read. The stream is truncated here.
    pub max_items: Option<u64>,

    /// Maximum records per page requested from the source
    pub page_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            source_locator: SourceLocator(String::new()),
            max_items: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ReaderConfig {
    pub fn new(locator: impl Into<SourceLocator>) -> Self {
        Self {
            source_locator: locator.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_locator.0.trim().is_empty() {
            return Err(VolleyError::InvalidConfiguration(
                "source_locator must not be empty".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(VolleyError::InvalidConfiguration(
                "page_size must be positive".to_string(),
            ));
        }
        if self.max_items == Some(0) {
            return Err(VolleyError::InvalidConfiguration(
                "max_items must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

struct ReaderState<S> {
    source: Arc<S>,
    config: ReaderConfig,
    buffer: VecDeque<Vec<u8>>,
    next_token: Option<PageToken>,
    next_index: u64,
    pages_fetched: u64,
    finished: bool,
}

impl<S: ItemSource> ReaderState<S> {
    fn limit_reached(&self) -> bool {
        self.config
            .max_items
            .is_some_and(|max| self.next_index >= max)
    }

    async fn fetch(&mut self, page_token: Option<PageToken>) -> Result<()> {
        let item_limit = match self.config.max_items {
            Some(max) if self.source.supports_item_limit() => Some(max - self.next_index),
            _ => None,
        };
        let request = PageRequest {
            page_token,
            max_items: self.config.page_size,
            item_limit,
        };

        let Page {
            records,
            next_page_token,
        } = self
            .source
            .fetch_page(&self.config.source_locator, request)
            .await
            .map_err(into_unavailable)?;

        self.pages_fetched += 1;
        tracing::debug!(
            locator = %self.config.source_locator,
            page = self.pages_fetched,
            records = records.len(),
            has_more = next_page_token.is_some(),
            "Fetched item page"
        );

        self.buffer.extend(records);
        self.next_token = next_page_token;
        Ok(())
    }

    /// Produce the next item, fetching pages as needed.
    async fn advance(&mut self) -> Option<Result<Item>> {
        if self.finished {
            return None;
        }
        loop {
            if self.limit_reached() {
                tracing::debug!(max_items = ?self.config.max_items, "Item limit reached, truncating stream");
                self.finished = true;
                return None;
            }

            if let Some(raw) = self.buffer.pop_front() {
                let index = self.next_index;
                return match Item::parse(index, &raw) {
                    Ok(item) => {
                        self.next_index += 1;
                        Some(Ok(item))
                    }
                    Err(e) => {
                        tracing::error!(index, error = %e, "Failed to parse item");
                        self.finished = true;
                        Some(Err(VolleyError::MalformedInput {
                            index,
                            reason: e.to_string(),
                        }))
                    }
                };
            }

            // Page drained; an empty page with a token is followed, not treated as the end
            let Some(token) = self.next_token.take() else {
                tracing::debug!(items = self.next_index, "Item source exhausted");
                self.finished = true;
                return None;
            };

            if let Err(e) = self.fetch(Some(token)).await {
                tracing::error!(error = %e, "Failed to fetch item page");
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

fn into_unavailable(error: VolleyError) -> VolleyError {
    match error {
        e @ (VolleyError::SourceUnavailable(_) | VolleyError::MalformedInput { .. }) => e,
        other => VolleyError::SourceUnavailable(other.to_string()),
    }
}

/// Opens item streams over a source.
pub struct ItemReader;

impl ItemReader {
    /// Open a lazy item stream.
    ///
    /// The first page is fetched eagerly so an unreachable source is reported
    /// here as `SourceUnavailable` rather than as the first stream element.
    #[tracing::instrument(skip(source, config), fields(locator = %config.source_locator, page_size = config.page_size))]
    pub async fn open<S: ItemSource + 'static>(
        source: Arc<S>,
        config: ReaderConfig,
    ) -> Result<ItemStream> {
        config.validate()?;

        let mut state = ReaderState {
            source,
            config,
            buffer: VecDeque::new(),
            next_token: None,
            next_index: 0,
            pages_fetched: 0,
            finished: false,
        };
        state.fetch(None).await?;
        tracing::info!("Item source opened");

        let stream = stream::unfold(state, |mut state| async move {
            let next = state.advance().await?;
            Some((next, state))
        });

        Ok(Box::pin(stream))
    }
}
