//! Scoped database sessions.
//!
//! This library keeps at most one open session per backend per scope, where a
//! scope is either a worker or an inbound request, and guarantees that a
//! transaction begun through a `TransactionGuard` is never left open.
//! Sessions are backed by sqlx pools (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod hook;
pub mod scope;
pub mod session;
pub mod transport;

pub use config::{BackendDefinition, Config, Settings};
pub use error::{SessionError, SessionResult};
pub use scope::{RequestContext, RequestScope, ScopeKind, ScopeRegistry, SessionMode, WorkerScope};
pub use session::{SessionManager, TransactionGuard};
