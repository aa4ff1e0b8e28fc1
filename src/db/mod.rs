//! Database access layer.
//!
//! This module provides:
//! - The driver seam (`Connector`) and its sqlx-backed implementation
//! - Single-target and clustered connection pools
//! - The alias registry the HTTP layer resolves pools through
//! - Batch execution, parameter binding and result rendering
//! - The query macro cache

pub mod cluster;
pub mod driver;
pub mod executor;
pub mod macro_cache;
pub mod params;
pub mod pool;
pub mod registry;
pub mod types;

pub use cluster::ClusteredConnectionPool;
pub use driver::{Connector, DriverConnector};
pub use executor::StatementExecutor;
pub use macro_cache::{MacroCache, MacroResolver, expand_macros};
pub use params::ParamValue;
pub use pool::{ConnectionId, PoolPolicy, PoolStats, PooledConnection, SimpleConnectionPool};
pub use registry::{ConnectionPool, PoolRegistry};
