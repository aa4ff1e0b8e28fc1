//! Transport layer for the gateway.
//!
//! The gateway is served over plain HTTP; the `Transport` trait keeps the
//! server loop separate from the entry point.

pub mod http;

pub use http::{GatewayParams, HttpSettings, HttpTransport};

use crate::error::DbResult;
use std::future::Future;

/// Trait for gateway transport implementations.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
