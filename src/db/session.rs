//! sqlx-backed sessions and transactions.
//!
//! A `SqlSession` owns at most one pooled connection, checked out on first use and
//! returned to the pool when the session closes. Transactions are driven with
//! plain `BEGIN`/`COMMIT`/`ROLLBACK` statements on that connection so that a
//! transaction handle can be shared (`Arc<dyn Transaction>`) instead of borrowing
//! the connection.
//!
//! Drop paths cannot await. `start_rollback` and `start_close` therefore mark the
//! transaction as rolled back immediately and finish the I/O on a spawned task.
//! Every operation that takes the connection lock first completes such a pending
//! rollback, so a connection is never reused or returned with a transaction open.

use crate::db::DbConnection;
use crate::db::pool::DbPool;
use crate::error::{SessionError, SessionResult};
use crate::session::{Interceptor, IsolationLevel, Session, Transaction, TransactionRef};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

type ConnSlot = Option<DbConnection>;
type SharedConn = Arc<AsyncMutex<ConnSlot>>;

const ACTIVE: u8 = 0;
const COMMITTED: u8 = 1;
const ROLLED_BACK: u8 = 2;
const ROLLBACK_PENDING: u8 = 3;

/// Complete a rollback requested from a drop path. Must be called with the
/// connection lock held.
async fn settle_pending(slot: &mut ConnSlot, status: &AtomicU8) {
    if status.load(Ordering::SeqCst) != ROLLBACK_PENDING {
        return;
    }
    if let Some(conn) = slot.as_mut() {
        if let Err(e) = conn.rollback().await {
            warn!(error = %e, "Deferred rollback failed; discarding connection");
            if let Some(conn) = slot.take() {
                conn.discard().await;
            }
        }
    }
    status.store(ROLLED_BACK, Ordering::SeqCst);
}

pub struct SqlTransaction {
    id: String,
    session_id: String,
    conn: SharedConn,
    status: Arc<AtomicU8>,
}

impl SqlTransaction {
    fn new(session_id: &str, conn: SharedConn) -> Self {
        Self {
            id: format!("txn_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            conn,
            status: Arc::new(AtomicU8::new(ACTIVE)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn not_active(&self) -> SessionError {
        SessionError::fatal(format!("Transaction '{}' is no longer active", self.id))
    }
}

impl Transaction for SqlTransaction {
    fn commit(&self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            if self.status.load(Ordering::SeqCst) != ACTIVE {
                return Err(self.not_active());
            }
            let conn = slot
                .as_mut()
                .ok_or_else(|| SessionError::fatal("Session connection is gone"))?;
            conn.commit().await?;
            self.status.store(COMMITTED, Ordering::SeqCst);
            info!(session_id = %self.session_id, transaction_id = %self.id, "Transaction committed");
            Ok(())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            if self.status.load(Ordering::SeqCst) != ACTIVE {
                return Err(self.not_active());
            }
            let result = match slot.as_mut() {
                Some(conn) => conn.rollback().await,
                None => Err(SessionError::fatal("Session connection is gone")),
            };
            self.status.store(ROLLED_BACK, Ordering::SeqCst);
            if let Err(e) = &result {
                warn!(transaction_id = %self.id, error = %e, "Rollback failed; discarding connection");
                if let Some(conn) = slot.take() {
                    conn.discard().await;
                }
            } else {
                info!(session_id = %self.session_id, transaction_id = %self.id, "Transaction rolled back");
            }
            result
        })
    }

    fn was_committed(&self) -> bool {
        self.status.load(Ordering::SeqCst) == COMMITTED
    }

    fn was_rolled_back(&self) -> bool {
        matches!(
            self.status.load(Ordering::SeqCst),
            ROLLED_BACK | ROLLBACK_PENDING
        )
    }

    fn start_rollback(&self) {
        if self
            .status
            .compare_exchange(ACTIVE, ROLLBACK_PENDING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let conn = Arc::clone(&self.conn);
        let status = Arc::clone(&self.status);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut slot = conn.lock().await;
                    settle_pending(&mut slot, &status).await;
                });
            }
            Err(_) => {
                // Without a runtime the rollback cannot run; the connection is dropped
                // instead of going back to the pool with the transaction open.
                if let Ok(mut slot) = conn.try_lock() {
                    if let Some(conn) = slot.take() {
                        conn.abandon();
                    }
                }
                status.store(ROLLED_BACK, Ordering::SeqCst);
                warn!(transaction_id = %self.id, "No runtime for rollback; connection abandoned");
            }
        }
    }
}

impl std::fmt::Debug for SqlTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTransaction")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("status", &self.status.load(Ordering::SeqCst))
            .finish()
    }
}

pub struct SqlSession {
    id: String,
    backend: String,
    opened_at: DateTime<Utc>,
    pool: DbPool,
    conn: SharedConn,
    open: AtomicBool,
    current: parking_lot::Mutex<Option<Arc<SqlTransaction>>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    read_only: bool,
    stateless: bool,
}

impl SqlSession {
    pub(crate) fn new(
        backend: &str,
        pool: DbPool,
        connection: Option<DbConnection>,
        interceptor: Option<Arc<dyn Interceptor>>,
        read_only: bool,
        stateless: bool,
    ) -> Self {
        let session = Self {
            id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
            backend: backend.to_string(),
            opened_at: Utc::now(),
            pool,
            conn: Arc::new(AsyncMutex::new(connection)),
            open: AtomicBool::new(true),
            current: parking_lot::Mutex::new(None),
            interceptor,
            read_only,
            stateless,
        };
        if let Some(interceptor) = &session.interceptor {
            interceptor.on_session_open(&session.id);
        }
        debug!(
            backend = %session.backend,
            session_id = %session.id,
            stateless = session.stateless,
            "Session opened"
        );
        session
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    /// Lock the connection, finishing any deferred rollback and checking out a
    /// pooled connection if the session does not hold one yet.
    async fn checkout(&self) -> SessionResult<MutexGuard<'_, ConnSlot>> {
        let mut slot = self.conn.lock().await;
        if !self.open.load(Ordering::SeqCst) {
            return Err(SessionError::fatal(format!("Session '{}' is closed", self.id)));
        }
        let pending = self.current.lock().clone();
        if let Some(tx) = pending {
            settle_pending(&mut slot, &tx.status).await;
        }
        if slot.is_none() {
            *slot = Some(self.pool.acquire().await?);
        }
        Ok(slot)
    }

    fn active_transaction(&self) -> Option<Arc<SqlTransaction>> {
        self.current
            .lock()
            .as_ref()
            .filter(|tx| tx.is_active())
            .cloned()
    }
}

impl Session for SqlSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            if !self.open.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            let current = self.current.lock().take();
            if let Some(tx) = current {
                if tx
                    .status
                    .compare_exchange(ACTIVE, ROLLBACK_PENDING, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    warn!(session_id = %self.id, "Closing session with an active transaction; rolling back");
                }
                settle_pending(&mut slot, &tx.status).await;
            }
            drop(slot.take());
            info!(backend = %self.backend, session_id = %self.id, "Session closed");
            Ok(())
        })
    }

    fn start_close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let current = self.current.lock().take();
        let status = current.map(|tx| {
            let _ = tx.status.compare_exchange(
                ACTIVE,
                ROLLBACK_PENDING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            Arc::clone(&tx.status)
        });

        let conn = Arc::clone(&self.conn);
        let session_id = self.id.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut slot = conn.lock().await;
                    if let Some(status) = &status {
                        settle_pending(&mut slot, status).await;
                    }
                    drop(slot.take());
                    debug!(session_id = %session_id, "Session closed in background");
                });
            }
            Err(_) => {
                if let Ok(mut slot) = conn.try_lock() {
                    if let Some(conn) = slot.take() {
                        conn.abandon();
                    }
                }
                if let Some(status) = status {
                    status.store(ROLLED_BACK, Ordering::SeqCst);
                }
                warn!(session_id = %session_id, "No runtime to close session; connection abandoned");
            }
        }
    }

    fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> BoxFuture<'_, SessionResult<TransactionRef>> {
        Box::pin(async move {
            let mut slot = self.checkout().await?;
            if let Some(tx) = self.active_transaction() {
                return Err(SessionError::fatal(format!(
                    "Transaction '{}' is already active on session '{}'",
                    tx.id, self.id
                )));
            }
            let conn = slot
                .as_mut()
                .ok_or_else(|| SessionError::internal("Connection missing after checkout"))?;
            conn.begin(isolation, self.read_only).await?;

            let tx = Arc::new(SqlTransaction::new(&self.id, Arc::clone(&self.conn)));
            *self.current.lock() = Some(Arc::clone(&tx));
            info!(
                backend = %self.backend,
                session_id = %self.id,
                transaction_id = %tx.id,
                isolation = ?isolation,
                "Transaction begun"
            );
            Ok(tx as TransactionRef)
        })
    }

    fn transaction(&self) -> Option<TransactionRef> {
        self.current
            .lock()
            .as_ref()
            .map(|tx| Arc::clone(tx) as TransactionRef)
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, SessionResult<u64>> {
        Box::pin(async move {
            let sql = match &self.interceptor {
                Some(interceptor) => interceptor.on_prepare_statement(sql),
                None => sql.to_string(),
            };
            let mut slot = self.checkout().await?;
            let conn = slot
                .as_mut()
                .ok_or_else(|| SessionError::internal("Connection missing after checkout"))?;
            conn.execute(&sql).await
        })
    }
}

impl Drop for SqlSession {
    fn drop(&mut self) {
        if self.open.load(Ordering::SeqCst) {
            self.start_close();
        }
    }
}

impl std::fmt::Debug for SqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSession")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("open", &self.is_open())
            .field("stateless", &self.stateless)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDefinition;
    use crate::db::pool::create_pool;
    use std::time::Duration;

    fn memory_session() -> SqlSession {
        let def = BackendDefinition::parse("sqlite::memory:?writable=true").unwrap();
        let pool = create_pool(&def).unwrap();
        SqlSession::new("MAIN", pool, None, None, false, false)
    }

    async fn count(session: &SqlSession) -> u64 {
        // DELETE reports how many rows existed; the caller re-inserts when needed.
        session.execute("DELETE FROM t").await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let session = memory_session();
        session.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        let tx = session.begin_transaction(None).await.unwrap();
        session.execute("INSERT INTO t VALUES (1)").await.unwrap();
        tx.commit().await.unwrap();
        assert!(tx.was_committed());
        assert!(!tx.is_active());
        assert_eq!(count(&session).await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let session = memory_session();
        session.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        let tx = session.begin_transaction(None).await.unwrap();
        session.execute("INSERT INTO t VALUES (1)").await.unwrap();
        tx.rollback().await.unwrap();
        assert!(tx.was_rolled_back());
        assert_eq!(count(&session).await, 0);
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_commit() {
        let session = memory_session();
        let tx = session.begin_transaction(None).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(matches!(tx.commit().await, Err(SessionError::Fatal { .. })));
        assert!(matches!(tx.rollback().await, Err(SessionError::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_second_begin_while_active_is_fatal() {
        let session = memory_session();
        let _tx = session.begin_transaction(None).await.unwrap();
        let err = session.begin_transaction(None).await.unwrap_err();
        assert!(matches!(err, SessionError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_start_rollback_settles_before_next_use() {
        let session = memory_session();
        session.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        let tx = session.begin_transaction(None).await.unwrap();
        session.execute("INSERT INTO t VALUES (1)").await.unwrap();

        tx.start_rollback();
        assert!(tx.was_rolled_back());
        assert!(!tx.is_active());

        // The next statement must observe the rolled back state.
        assert_eq!(count(&session).await, 0);
        let next = session.begin_transaction(None).await.unwrap();
        assert!(next.is_active());
    }

    #[tokio::test]
    async fn test_close_rolls_back_and_is_idempotent() {
        let session = memory_session();
        let tx = session.begin_transaction(None).await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open());
        assert!(tx.was_rolled_back());
        session.close().await.unwrap();
        assert!(matches!(
            session.execute("SELECT 1").await,
            Err(SessionError::Fatal { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_close_releases_connection_to_pool() {
        let def = BackendDefinition::parse("sqlite::memory:?writable=true&acquire_timeout=2").unwrap();
        let pool = create_pool(&def).unwrap();
        let session = SqlSession::new("MAIN", pool.clone(), None, None, false, false);
        let tx = session.begin_transaction(None).await.unwrap();

        session.start_close();
        assert!(!session.is_open());
        assert!(tx.was_rolled_back());

        // The single pooled connection comes back once the background close finishes.
        let conn = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .unwrap();
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_interceptor_sees_statements() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl Interceptor for Recorder {
            fn on_prepare_statement(&self, sql: &str) -> String {
                self.0.lock().unwrap().push(sql.to_string());
                sql.to_string()
            }
        }

        let recorder = Arc::new(Recorder::default());
        let def = BackendDefinition::parse("sqlite::memory:?writable=true").unwrap();
        let session = SqlSession::new(
            "MAIN",
            create_pool(&def).unwrap(),
            None,
            Some(recorder.clone() as Arc<dyn Interceptor>),
            false,
            false,
        );
        session.execute("SELECT 1").await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["SELECT 1"]);
    }
}
