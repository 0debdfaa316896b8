//! Database abstraction layer.
//!
//! This module provides the sqlx-backed implementation of the session contracts:
//! - Connection pool management (`DbPool`, `DbConnection`)
//! - Dialect-specific transaction control
//! - `SqlFactory` / `SqlSession` / `SqlTransaction`
//! - `SqlxFactoryBuilder` for building factories from backend definitions

pub mod factory;
pub mod pool;
pub mod session;
pub mod types;

pub use factory::{SqlFactory, SqlxFactoryBuilder};
pub use pool::{DbConnection, DbPool, create_pool};
pub use session::{SqlSession, SqlTransaction};
pub use types::DatabaseType;
