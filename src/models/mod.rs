//! Data models for the SQL bridge.
//!
//! This module re-exports all model types used throughout the crate.

pub mod result;
pub mod value;

// Re-export commonly used types
pub use result::{ExecSummary, PoolStats};
pub use value::{Row, Value, args_from_json};
