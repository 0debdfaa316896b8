//! Run modes for the binary.
//!
//! - Worker: each backend is exercised by its own worker with a `WorkerScope`
//! - HTTP: an axum app with the request hook installed; one `RequestScope` per request

pub mod http;
pub mod worker;

pub use http::HttpServer;
pub use worker::WorkerRunner;

use crate::error::SessionResult;
use std::future::Future;

/// A run mode driving the session manager.
pub trait Transport: Send + Sync {
    /// Run until the work is done or the process is asked to stop.
    fn run(&self) -> impl Future<Output = SessionResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
