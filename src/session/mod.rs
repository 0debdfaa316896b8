//! Session management layer.
//!
//! This module provides the scoped session facade and the collaborator contracts it
//! consumes:
//! - `SessionFactory` / `Session` / `Transaction`: the data-access primitives
//! - `Interceptor`: per-session statement hooks, resolved by type identifier
//! - `FactoryBuilder`: builds a factory from a declarative backend definition
//! - `FactoryTable` and `AliasMap`: process-wide backend registration
//! - `SessionManager`: the facade coordinating all of the above
//! - `TransactionGuard`: rolls back on every exit path that did not commit

pub mod aliases;
pub mod factory_table;
pub mod guard;
pub mod interceptor;
pub mod manager;

pub use aliases::{AliasMap, parse_alias_spec};
pub use factory_table::FactoryTable;
pub use guard::TransactionGuard;
pub use interceptor::{InterceptorRegistry, TracingInterceptor};
pub use manager::{ConfigState, SessionInfo, SessionManager};

use crate::config::BackendDefinition;
use crate::db::{DatabaseType, DbConnection};
use crate::error::SessionResult;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Shared handle to an open session.
pub type SessionRef = Arc<dyn Session>;

/// Shared handle to a begun transaction.
pub type TransactionRef = Arc<dyn Transaction>;

/// Shared handle to a backend factory.
pub type FactoryRef = Arc<dyn SessionFactory>;

/// Transaction isolation levels understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// ANSI SQL spelling, e.g. `READ COMMITTED`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A named backend's session factory.
pub trait SessionFactory: fmt::Debug + Send + Sync {
    /// Database flavour behind this factory, if it is backed by one.
    fn database_type(&self) -> Option<DatabaseType>;

    /// Obtain a raw connection from the factory's connection provider.
    ///
    /// Fails with `SessionError::Config` when the factory has no provider.
    fn connection(&self) -> BoxFuture<'_, SessionResult<DbConnection>>;

    /// Open a new session. `None` draws a connection from the factory's own provider.
    fn open_session(
        &self,
        connection: Option<DbConnection>,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> BoxFuture<'_, SessionResult<SessionRef>>;

    /// Open a session that is never tracked by a scope.
    fn open_stateless_session(&self) -> BoxFuture<'_, SessionResult<SessionRef>>;

    /// Release the factory's resources (connection pool).
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// An open unit-of-work handle.
pub trait Session: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;

    fn opened_at(&self) -> DateTime<Utc>;

    fn is_open(&self) -> bool;

    /// Close the session, rolling back a transaction that is still in flight.
    fn close(&self) -> BoxFuture<'_, SessionResult<()>>;

    /// Close without awaiting, for drop paths.
    ///
    /// `is_open()` is false on return. Any pending rollback must complete before
    /// the underlying connection is released.
    fn start_close(&self);

    fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> BoxFuture<'_, SessionResult<TransactionRef>>;

    /// The transaction most recently begun on this session, if any.
    fn transaction(&self) -> Option<TransactionRef>;

    /// Execute a statement, returning the number of affected rows.
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, SessionResult<u64>>;
}

/// A begun transaction.
pub trait Transaction: fmt::Debug + Send + Sync {
    /// Fails with `SessionError::Fatal` if the transaction is no longer active.
    fn commit(&self) -> BoxFuture<'_, SessionResult<()>>;

    /// Fails with `SessionError::Fatal` if the transaction is no longer active.
    fn rollback(&self) -> BoxFuture<'_, SessionResult<()>>;

    fn was_committed(&self) -> bool;

    fn was_rolled_back(&self) -> bool;

    fn is_active(&self) -> bool {
        !self.was_committed() && !self.was_rolled_back()
    }

    /// Roll back without awaiting, for drop paths.
    ///
    /// `was_rolled_back()` is true on return; the backend may finish the I/O later
    /// but must not release the connection with the transaction still open.
    fn start_rollback(&self);
}

/// Hooks invoked by sessions opened with an interceptor.
pub trait Interceptor: Send + Sync {
    fn on_session_open(&self, _session_id: &str) {}

    /// Inspect or rewrite a statement before it is sent.
    fn on_prepare_statement(&self, sql: &str) -> String {
        sql.to_string()
    }
}

/// Builds factories from declarative backend definitions.
pub trait FactoryBuilder: Send + Sync {
    fn build<'a>(
        &'a self,
        definition: &'a BackendDefinition,
    ) -> BoxFuture<'a, SessionResult<FactoryRef>>;
}
