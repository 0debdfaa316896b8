//! In-memory fake backend for integration tests.
//!
//! Every factory built here shares one `FakeState`, which counts what happened
//! and lets a test inject commit failures.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use db_session_scope::config::{BackendDefinition, Settings};
use db_session_scope::db::{DatabaseType, DbConnection};
use db_session_scope::error::{SessionError, SessionResult};
use db_session_scope::scope::ScopeKind;
use db_session_scope::session::{
    FactoryBuilder, FactoryRef, Interceptor, IsolationLevel, Session, SessionFactory,
    SessionManager, SessionRef, Transaction, TransactionRef,
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct FakeState {
    pub fail_commit: AtomicBool,
    pub factories_built: AtomicUsize,
    pub factories_closed: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub intercepted: AtomicUsize,
    pub built_names: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn built(&self) -> usize {
        self.factories_built.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeTransaction {
    state: Arc<FakeState>,
    committed: AtomicBool,
    rolled_back: AtomicBool,
    pub isolation: Option<IsolationLevel>,
}

impl Transaction for FakeTransaction {
    fn commit(&self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            if !self.is_active() {
                return Err(SessionError::fatal("transaction is not active"));
            }
            if self.state.fail_commit.load(Ordering::SeqCst) {
                return Err(SessionError::database("deadlock detected", Some("40P01".to_string()), "retry"));
            }
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            if !self.is_active() {
                return Err(SessionError::fatal("transaction is not active"));
            }
            self.rolled_back.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn was_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    fn was_rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::SeqCst)
    }

    fn start_rollback(&self) {
        if self.is_active() {
            self.rolled_back.store(true, Ordering::SeqCst);
        }
    }
}

pub struct FakeSession {
    id: String,
    backend: String,
    opened_at: DateTime<Utc>,
    open: AtomicBool,
    state: Arc<FakeState>,
    current: Mutex<Option<Arc<FakeTransaction>>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    pub stateless: bool,
}

impl FakeSession {
    fn new(
        backend: &str,
        state: Arc<FakeState>,
        interceptor: Option<Arc<dyn Interceptor>>,
        stateless: bool,
    ) -> Self {
        let n = state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", backend.to_lowercase(), n);
        if let Some(interceptor) = &interceptor {
            interceptor.on_session_open(&id);
        }
        Self {
            id,
            backend: backend.to_string(),
            opened_at: Utc::now(),
            open: AtomicBool::new(true),
            state,
            current: Mutex::new(None),
            interceptor,
            stateless,
        }
    }

    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.current.lock().as_ref() {
                tx.start_rollback();
            }
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for FakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSession")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("open", &self.is_open())
            .field("stateless", &self.stateless)
            .finish()
    }
}

impl Session for FakeSession {
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
            self.mark_closed();
            Ok(())
        })
    }

    fn start_close(&self) {
        self.mark_closed();
    }

    fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> BoxFuture<'_, SessionResult<TransactionRef>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(SessionError::fatal("session is closed"));
            }
            let tx = Arc::new(FakeTransaction {
                state: Arc::clone(&self.state),
                committed: AtomicBool::new(false),
                rolled_back: AtomicBool::new(false),
                isolation,
            });
            *self.current.lock() = Some(Arc::clone(&tx));
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
            if let Some(interceptor) = &self.interceptor {
                interceptor.on_prepare_statement(sql);
                self.state.intercepted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(0)
        })
    }
}

#[derive(Debug)]
pub struct FakeFactory {
    pub backend: String,
    state: Arc<FakeState>,
}

impl FakeFactory {
    pub fn new(backend: &str, state: Arc<FakeState>) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.to_string(),
            state,
        })
    }
}

impl SessionFactory for FakeFactory {
    fn database_type(&self) -> Option<DatabaseType> {
        None
    }

    fn connection(&self) -> BoxFuture<'_, SessionResult<DbConnection>> {
        Box::pin(async { Err(SessionError::config("fake backend has no connection provider")) })
    }

    fn open_session(
        &self,
        _connection: Option<DbConnection>,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> BoxFuture<'_, SessionResult<SessionRef>> {
        Box::pin(async move {
            let session = FakeSession::new(&self.backend, Arc::clone(&self.state), interceptor, false);
            Ok(Arc::new(session) as SessionRef)
        })
    }

    fn open_stateless_session(&self) -> BoxFuture<'_, SessionResult<SessionRef>> {
        Box::pin(async move {
            let session = FakeSession::new(&self.backend, Arc::clone(&self.state), None, true);
            Ok(Arc::new(session) as SessionRef)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.factories_closed.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Builds `FakeFactory` instances; a definition whose url is `fail:` fails to build.
pub struct FakeBuilder {
    pub state: Arc<FakeState>,
}

impl FactoryBuilder for FakeBuilder {
    fn build<'a>(
        &'a self,
        definition: &'a BackendDefinition,
    ) -> BoxFuture<'a, SessionResult<FactoryRef>> {
        Box::pin(async move {
            if definition.url.starts_with("fail:") {
                return Err(SessionError::connection("cannot reach backend", "check the url"));
            }
            // Give concurrent callers a chance to interleave.
            tokio::task::yield_now().await;
            self.state.factories_built.fetch_add(1, Ordering::SeqCst);
            self.state.built_names.lock().push(definition.name.clone());
            Ok(FakeFactory::new(&definition.name, Arc::clone(&self.state)) as FactoryRef)
        })
    }
}

pub fn fake(name: &str) -> BackendDefinition {
    BackendDefinition {
        name: name.to_string(),
        url: "fake:".to_string(),
        ..BackendDefinition::default()
    }
}

/// A manager whose backends are fakes built from `settings`.
pub fn fake_manager_with(kind: ScopeKind, settings: Settings) -> (Arc<SessionManager>, Arc<FakeState>) {
    let state = Arc::new(FakeState::default());
    let builder = Arc::new(FakeBuilder {
        state: Arc::clone(&state),
    });
    let manager = SessionManager::with_factory_builder(kind, settings, builder);
    (Arc::new(manager), state)
}

/// A worker-scoped manager configured with the named fake backends.
pub fn fake_manager(names: &[&str]) -> (Arc<SessionManager>, Arc<FakeState>) {
    fake_manager_with(
        ScopeKind::Worker,
        Settings {
            backends: names.iter().map(|name| fake(name)).collect(),
            ..Settings::default()
        },
    )
}
