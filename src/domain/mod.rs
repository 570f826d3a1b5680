//! Core domain types for the volley engine.
//!
//! This module contains pure data types with no I/O:
//! - Items read from the source
//! - Batches and the policy that bounds them
//! - Per-batch outcomes and the run result
//! - The batch dispatch typestate machine

pub mod batch;
pub mod dispatch;
pub mod item;
pub mod outcome;
