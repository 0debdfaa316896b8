//! sqlx-backed session factories.

use crate::config::BackendDefinition;
use crate::db::pool::{DbPool, create_pool};
use crate::db::session::SqlSession;
use crate::db::{DatabaseType, DbConnection};
use crate::error::SessionResult;
use crate::session::{FactoryBuilder, FactoryRef, Interceptor, SessionFactory, SessionRef};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

/// Session factory over one lazily-connecting pool.
#[derive(Debug)]
pub struct SqlFactory {
    backend: String,
    pool: DbPool,
    writable: bool,
}

impl SqlFactory {
    pub fn new(definition: &BackendDefinition) -> SessionResult<Self> {
        Ok(Self {
            backend: definition.name.clone(),
            pool: create_pool(definition)?,
            writable: definition.writable,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl SessionFactory for SqlFactory {
    fn database_type(&self) -> Option<DatabaseType> {
        Some(self.pool.db_type())
    }

    fn connection(&self) -> BoxFuture<'_, SessionResult<DbConnection>> {
        Box::pin(self.pool.acquire())
    }

    fn open_session(
        &self,
        connection: Option<DbConnection>,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> BoxFuture<'_, SessionResult<SessionRef>> {
        Box::pin(async move {
            let session = SqlSession::new(
                &self.backend,
                self.pool.clone(),
                connection,
                interceptor,
                !self.writable,
                false,
            );
            Ok(Arc::new(session) as SessionRef)
        })
    }

    fn open_stateless_session(&self) -> BoxFuture<'_, SessionResult<SessionRef>> {
        Box::pin(async move {
            let session =
                SqlSession::new(&self.backend, self.pool.clone(), None, None, !self.writable, true);
            Ok(Arc::new(session) as SessionRef)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            info!(backend = %self.backend, "Connection pool closed");
        })
    }
}

/// Builds `SqlFactory` instances from backend definitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlxFactoryBuilder;

impl FactoryBuilder for SqlxFactoryBuilder {
    fn build<'a>(
        &'a self,
        definition: &'a BackendDefinition,
    ) -> BoxFuture<'a, SessionResult<FactoryRef>> {
        Box::pin(async move { Ok(Arc::new(SqlFactory::new(definition)?) as FactoryRef) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[tokio::test]
    async fn test_builder_creates_sqlite_factory() {
        let def = BackendDefinition::parse("main=sqlite::memory:?writable=true").unwrap();
        let factory = SqlxFactoryBuilder.build(&def).await.unwrap();
        assert_eq!(factory.database_type(), Some(DatabaseType::SQLite));

        let session = factory.open_session(None, None).await.unwrap();
        assert!(session.is_open());
        assert_eq!(session.execute("SELECT 1").await.unwrap(), 0);
        session.close().await.unwrap();
        factory.close().await;
    }

    #[tokio::test]
    async fn test_session_over_supplied_connection() {
        let def = BackendDefinition::parse("sqlite::memory:?writable=true").unwrap();
        let factory = SqlFactory::new(&def).unwrap();
        let conn = factory.connection().await.unwrap();
        let session = factory.open_session(Some(conn), None).await.unwrap();
        session.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_only_sqlite_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        let url = format!("sqlite:{}", path.display());

        let writable = SqlFactory::new(&BackendDefinition::parse(&format!("{url}?writable=true")).unwrap()).unwrap();
        let session = writable.open_session(None, None).await.unwrap();
        session.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        session.close().await.unwrap();
        writable.close().await;

        let read_only = SqlFactory::new(&BackendDefinition::parse(&url).unwrap()).unwrap();
        assert!(!read_only.is_writable());
        let session = read_only.open_stateless_session().await.unwrap();
        let err = session.execute("INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(matches!(err, SessionError::Database { .. }));
    }
}
