//! Dispatch aggregate - the lifecycle of one batch inside a worker.
//!
//! This module contains:
//! - Dispatch states (typestate pattern)
//! - State transition methods, including retry with backoff

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::RetryConfig;
