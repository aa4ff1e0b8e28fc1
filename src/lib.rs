//! DB HTTP Gateway Library
//!
//! Pooled SQL access over HTTP: clients post JSON statement batches against a
//! named database alias (SQLite, PostgreSQL, MySQL, or a read/write-splitting
//! cluster of them) and get JSON result sets back.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod transport;

pub use config::{Cli, GatewayConfig};
pub use db::{PoolRegistry, StatementExecutor};
pub use error::DbError;
