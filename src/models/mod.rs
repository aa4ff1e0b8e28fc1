//! Data models for the gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod batch;
pub mod connection;

// Re-export commonly used types
pub use batch::{
    BatchMode, BatchRequest, BatchResult, StatementResult, StatementSpec, StatementStatus,
    encode_batch_result, error_body,
};
pub use connection::{DatabaseType, masked_dsn};
