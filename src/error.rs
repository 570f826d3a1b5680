//! Error types for the batch execution engine.

use thiserror::Error;

use crate::domain::outcome::RunResult;

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the engine.
///
/// Only configuration and source-reading failures are run-fatal. Failures of
/// individual batch invocations are recorded as outcomes instead and never
/// surface through this type.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Configuration rejected during validation, before any I/O
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The item source could not be reached or refused to serve a page
    #[error("Item source unavailable: {0}")]
    SourceUnavailable(String),

    /// A record could not be parsed into an item
    #[error("Malformed input at item {index}: {reason}")]
    MalformedInput { index: u64, reason: String },

    /// Reading failed after dispatch had started. Carries whatever outcomes
    /// were known when the run stopped.
    #[error("Run aborted while reading items: {cause}")]
    ReadAborted {
        cause: Box<VolleyError>,
        partial: Box<RunResult>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from a local source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// True for errors raised while reading the item source.
    pub fn is_reading_error(&self) -> bool {
        matches!(
            self,
            VolleyError::SourceUnavailable(_)
                | VolleyError::MalformedInput { .. }
                | VolleyError::ReadAborted { .. }
        )
    }

    /// The partial result attached to a reading abort, if any.
    pub fn partial_result(&self) -> Option<&RunResult> {
        match self {
            VolleyError::ReadAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Helper functions for turning error chains into plain data.
///
/// Outcomes outlive the errors that produced them, so failures are stored as
/// a message plus the rendered source chain.
pub mod error_serialization {
    use serde::{Deserialize, Serialize};

    /// Serialized error format that preserves error message and source chain.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ErrorDetail {
        /// The main error message
        pub message: String,
        /// Chain of source errors, if any
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub sources: Vec<String>,
    }

    impl ErrorDetail {
        /// Build a detail with no source chain.
        pub fn new(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
                sources: Vec::new(),
            }
        }

        /// Capture an error and its full source chain.
        pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
            let mut sources = Vec::new();
            let mut current = error.source();
            while let Some(source) = current {
                sources.push(source.to_string());
                current = source.source();
            }
            Self {
                message: error.to_string(),
                sources,
            }
        }
    }

    impl std::fmt::Display for ErrorDetail {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)?;
            for (i, source) in self.sources.iter().enumerate() {
                write!(f, "\n  {}: {}", i + 1, source)?;
            }
            Ok(())
        }
    }

}
