//! The session manager facade.
//!
//! One `SessionManager` is constructed at startup and shared (`Arc`) with every
//! caller. It owns the process-wide state (factory table, aliases, configuration
//! flags); per-scope state lives in the `ScopeRegistry` each call is given.

use super::aliases::{AliasMap, parse_alias_spec};
use super::factory_table::{FactoryTable, canonical_name};
use super::guard::TransactionGuard;
use super::interceptor::InterceptorRegistry;
use super::{FactoryBuilder, FactoryRef, Interceptor, IsolationLevel, SessionRef, TransactionRef};
use crate::config::{BackendDefinition, Settings};
use crate::db::{DbConnection, SqlxFactoryBuilder};
use crate::error::{SessionError, SessionResult};
use crate::scope::{ScopeKind, ScopeRegistry, SessionMode};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Configuration lifecycle of a `SessionManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigState {
    #[default]
    Unconfigured,
    Configuring,
    Configured,
}

/// Snapshot of one scoped session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub backend: String,
    pub session_id: String,
    pub opened_at: DateTime<Utc>,
    pub open: bool,
    pub in_transaction: bool,
}

pub struct SessionManager {
    scope_kind: ScopeKind,
    settings: RwLock<Settings>,
    builder: Arc<dyn FactoryBuilder>,
    interceptors: InterceptorRegistry,
    factories: RwLock<FactoryTable>,
    aliases: RwLock<AliasMap>,
    interceptor_type: RwLock<Option<String>>,
    state: Mutex<ConfigState>,
    configured: AtomicBool,
    configure_lock: tokio::sync::Mutex<()>,
    common_loaded: Mutex<bool>,
    request_hook_installed: AtomicBool,
}

impl SessionManager {
    /// Create a manager that builds sqlx-backed factories.
    pub fn new(scope_kind: ScopeKind, settings: Settings) -> Self {
        Self::with_factory_builder(scope_kind, settings, Arc::new(SqlxFactoryBuilder))
    }

    pub fn with_factory_builder(
        scope_kind: ScopeKind,
        settings: Settings,
        builder: Arc<dyn FactoryBuilder>,
    ) -> Self {
        Self {
            scope_kind,
            settings: RwLock::new(settings),
            builder,
            interceptors: InterceptorRegistry::new(),
            factories: RwLock::new(FactoryTable::new()),
            aliases: RwLock::new(AliasMap::new()),
            interceptor_type: RwLock::new(None),
            state: Mutex::new(ConfigState::Unconfigured),
            configured: AtomicBool::new(false),
            configure_lock: tokio::sync::Mutex::new(()),
            common_loaded: Mutex::new(false),
            request_hook_installed: AtomicBool::new(false),
        }
    }

    pub fn scope_kind(&self) -> ScopeKind {
        self.scope_kind
    }

    pub fn state(&self) -> ConfigState {
        *self.state.lock()
    }

    /// Registry used to resolve the configured interceptor type identifier.
    pub fn interceptors(&self) -> &InterceptorRegistry {
        &self.interceptors
    }

    // ---------------------------------------------------------------------
    // Scope mode and hook
    // ---------------------------------------------------------------------

    pub fn session_mode(&self, scope: &dyn ScopeRegistry) -> SessionMode {
        scope.session_mode()
    }

    pub fn set_session_mode(&self, scope: &dyn ScopeRegistry, mode: SessionMode) {
        debug!(mode = %mode, "Session mode set");
        scope.set_session_mode(mode);
    }

    pub fn request_hook_installed(&self) -> bool {
        self.request_hook_installed.load(Ordering::Acquire)
    }

    pub fn set_request_hook_installed(&self, installed: bool) {
        self.request_hook_installed.store(installed, Ordering::Release);
    }

    fn check_scope(&self, scope: &dyn ScopeRegistry) -> SessionResult<()> {
        if scope.kind() != self.scope_kind {
            return Err(SessionError::config(format!(
                "Session manager uses {} scopes but was given a {} scope",
                self.scope_kind,
                scope.kind()
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Factory lookup
    // ---------------------------------------------------------------------

    /// Resolve an alias or backend name to its canonical backend name.
    ///
    /// Returns an empty string when `alias` is neither a bound alias nor a
    /// registered backend.
    pub fn get_factory_name(&self, alias: &str) -> String {
        if let Some(target) = self.aliases.read().get(alias) {
            return canonical_name(target);
        }
        let name = canonical_name(alias);
        if self.factories.read().contains_key(&name) {
            return name;
        }
        String::new()
    }

    /// The key a session for `name` is held under in a scope.
    ///
    /// Unlike `get_factory_name` this never collapses an unknown name to the
    /// empty string, which is the default backend's key.
    fn scope_key(&self, name: &str) -> String {
        match self.aliases.read().get(name) {
            Some(target) => canonical_name(target),
            None => canonical_name(name),
        }
    }

    /// Resolve `name` to a registered backend, configuring lazily on first use.
    async fn resolve(&self, name: &str) -> SessionResult<(String, FactoryRef)> {
        self.ensure_configured().await?;
        let key = self.scope_key(name);
        let factory = self.factories.read().try_get(&key);
        match factory {
            Some(factory) => {
                debug!(requested = %name, backend = %key, "Resolved backend");
                Ok((key, factory))
            }
            None => Err(SessionError::not_found(name)),
        }
    }

    pub async fn get_factory(&self, name: &str) -> SessionResult<FactoryRef> {
        self.resolve(name).await.map(|(_, factory)| factory)
    }

    pub async fn get_connection(&self, name: &str) -> SessionResult<DbConnection> {
        let factory = self.get_factory(name).await?;
        factory.connection().await
    }

    /// Canonical names of every registered backend, sorted.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .keys()
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    fn default_interceptor(&self) -> Option<Arc<dyn Interceptor>> {
        let type_id = self.interceptor_type.read().clone()?;
        self.interceptors.create(&type_id)
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Open a new session and register it in `scope`.
    pub async fn open_session(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
    ) -> SessionResult<SessionRef> {
        self.open_session_with(scope, name, None, None).await
    }

    /// Open a new session over an explicit connection and/or interceptor.
    ///
    /// Without an interceptor the configured default interceptor type is used.
    pub async fn open_session_with(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
        connection: Option<DbConnection>,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> SessionResult<SessionRef> {
        self.check_scope(scope)?;
        if self.scope_kind == ScopeKind::Request && !self.request_hook_installed() {
            return Err(SessionError::config(
                "Request-scoped sessions require the request hook to be installed",
            ));
        }

        let (key, factory) = self.resolve(name).await?;
        let interceptor = interceptor.or_else(|| self.default_interceptor());
        let session = factory.open_session(connection, interceptor).await?;

        if let Err(e) = scope.add(&key, Arc::clone(&session)) {
            if let Err(close_err) = session.close().await {
                warn!(backend = %key, error = %close_err, "Failed to close rejected session");
            }
            return Err(e);
        }
        if scope.session_mode() == SessionMode::Unknown {
            scope.set_session_mode(SessionMode::Manual);
        }

        info!(backend = %key, session_id = %session.id(), "Session opened");
        Ok(session)
    }

    /// The scoped session for `name`, opening one if none is held.
    pub async fn get_session(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
    ) -> SessionResult<SessionRef> {
        self.check_scope(scope)?;
        let (key, _) = self.resolve(name).await?;
        if scope.contains_key(&key) {
            return scope.get(&key);
        }
        self.open_session(scope, name).await
    }

    /// Open an unscoped stateless session. The caller owns it.
    pub async fn stateless_session(&self, name: &str) -> SessionResult<SessionRef> {
        let (key, factory) = self.resolve(name).await?;
        let session = factory.open_stateless_session().await?;
        debug!(backend = %key, session_id = %session.id(), "Stateless session opened");
        Ok(session)
    }

    pub fn has_open_session(&self, scope: &dyn ScopeRegistry, name: &str) -> bool {
        let key = self.scope_key(name);
        scope.get(&key).is_ok_and(|session| session.is_open())
    }

    /// Close and unregister the scoped session for `name`. No-op if none is held.
    pub async fn close_session(&self, scope: &dyn ScopeRegistry, name: &str) -> SessionResult<()> {
        self.check_scope(scope)?;
        let key = self.scope_key(name);
        let Ok(session) = scope.get(&key) else {
            return Ok(());
        };
        let result = if session.is_open() {
            session.close().await
        } else {
            Ok(())
        };
        scope.remove(&key);
        info!(backend = %key, session_id = %session.id(), "Session closed");
        result
    }

    /// Close every session held by `scope`.
    ///
    /// All sessions are closed and removed even if some fail; the first failure
    /// is returned.
    pub async fn close_all_sessions(&self, scope: &dyn ScopeRegistry) -> SessionResult<()> {
        self.check_scope(scope)?;
        let mut first_error = None;
        for (key, session) in scope.entries() {
            if session.is_open() {
                if let Err(e) = session.close().await {
                    warn!(backend = %key, session_id = %session.id(), error = %e, "Failed to close session");
                    first_error.get_or_insert(e);
                }
            }
            scope.remove(&key);
            debug!(backend = %key, session_id = %session.id(), "Session closed");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn restart_session(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
    ) -> SessionResult<SessionRef> {
        self.close_session(scope, name).await?;
        self.open_session(scope, name).await
    }

    /// Remove `session` from `scope` and close it without awaiting.
    pub(crate) fn discard_session(&self, scope: &dyn ScopeRegistry, key: &str, session: &SessionRef) {
        if scope
            .get(key)
            .is_ok_and(|held| Arc::ptr_eq(&held, session))
        {
            scope.remove(key);
        }
        session.start_close();
    }

    /// Sessions currently held by `scope`, sorted by backend.
    pub fn list_sessions(&self, scope: &dyn ScopeRegistry) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = scope
            .entries()
            .into_iter()
            .map(|(backend, session)| SessionInfo {
                backend,
                session_id: session.id().to_string(),
                opened_at: session.opened_at(),
                open: session.is_open(),
                in_transaction: session.transaction().is_some_and(|tx| tx.is_active()),
            })
            .collect();
        sessions.sort_by(|a, b| a.backend.cmp(&b.backend));
        sessions
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    async fn begin_in_scope(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
        isolation: Option<IsolationLevel>,
    ) -> SessionResult<(String, SessionRef, TransactionRef)> {
        self.check_scope(scope)?;
        let auto = scope.session_mode() == SessionMode::Unknown;
        if auto {
            scope.set_session_mode(SessionMode::AutoTransactionScope);
        }

        let session = match self.get_session(scope, name).await {
            Ok(session) => session,
            Err(e) => {
                if auto && scope.is_empty() {
                    scope.set_session_mode(SessionMode::Unknown);
                }
                return Err(e);
            }
        };
        let transaction = session.begin_transaction(isolation).await?;
        let key = self.scope_key(name);
        Ok((key, session, transaction))
    }

    /// Begin a transaction on the scoped session, opening one if needed.
    pub async fn begin_transaction(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
        isolation: Option<IsolationLevel>,
    ) -> SessionResult<TransactionRef> {
        self.begin_in_scope(scope, name, isolation)
            .await
            .map(|(_, _, transaction)| transaction)
    }

    /// The scoped session and its current transaction.
    async fn scoped_transaction(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
    ) -> SessionResult<(String, TransactionRef)> {
        self.check_scope(scope)?;
        let (key, _) = self.resolve(name).await?;
        let session = scope.get(&key).map_err(|_| {
            SessionError::fatal(format!("No open session for backend '{}'", key))
        })?;
        let transaction = session.transaction().ok_or_else(|| {
            SessionError::fatal(format!("No transaction has been begun on backend '{}'", key))
        })?;
        Ok((key, transaction))
    }

    pub async fn commit_transaction(&self, scope: &dyn ScopeRegistry, name: &str) -> SessionResult<()> {
        let (key, transaction) = self.scoped_transaction(scope, name).await?;
        transaction.commit().await?;
        if scope.session_mode() == SessionMode::AutoTransactionScope {
            self.close_session(scope, &key).await?;
        }
        Ok(())
    }

    pub async fn rollback_transaction(
        &self,
        scope: &dyn ScopeRegistry,
        name: &str,
    ) -> SessionResult<()> {
        let (key, transaction) = self.scoped_transaction(scope, name).await?;
        transaction.rollback().await?;
        if scope.session_mode() == SessionMode::AutoTransactionScope {
            self.close_session(scope, &key).await?;
        }
        Ok(())
    }

    /// Begin a transaction wrapped in a guard that rolls back unless committed.
    pub async fn transaction<'a>(
        &'a self,
        scope: &'a dyn ScopeRegistry,
        name: &str,
        isolation: Option<IsolationLevel>,
    ) -> SessionResult<TransactionGuard<'a>> {
        let (key, session, transaction) = self.begin_in_scope(scope, name, isolation).await?;
        Ok(TransactionGuard::new(self, scope, key, session, transaction))
    }

    // ---------------------------------------------------------------------
    // Aliases
    // ---------------------------------------------------------------------

    /// Replace the alias table with the bindings in `spec`.
    pub fn set_aliases(&self, spec: &str) {
        self.set_aliases_map(parse_alias_spec(spec));
    }

    pub fn set_aliases_map<I, A, B>(&self, pairs: I)
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut aliases = self.aliases.write();
        aliases.clear();
        aliases.extend(pairs);
    }

    /// Replace the alias table with `aliases`, all bound to `name`.
    pub fn set_factory_aliases(&self, name: &str, aliases: &[&str]) {
        self.set_aliases_map(aliases.iter().map(|alias| (*alias, name)));
    }

    /// Merge the bindings in `spec`; existing aliases are kept.
    pub fn add_aliases(&self, spec: &str) {
        self.add_aliases_map(parse_alias_spec(spec));
    }

    pub fn add_aliases_map<I, A, B>(&self, pairs: I)
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        self.aliases.write().extend(pairs);
    }

    pub fn add_factory_aliases(&self, name: &str, aliases: &[&str]) {
        self.add_aliases_map(aliases.iter().map(|alias| (*alias, name)));
    }

    /// Bind `alias` to `name` unless `alias` is already bound. Returns whether it was bound.
    pub fn add_alias(&self, alias: &str, name: &str) -> bool {
        self.aliases.write().add(alias, name)
    }

    /// Aliases bound to the backend `name`.
    pub fn aliases_of(&self, name: &str) -> Vec<String> {
        self.aliases.read().aliases_of(name)
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    /// Register a prebuilt factory. Returns `false` if `name` was already registered.
    pub fn add_session_factory(
        &self,
        factory: FactoryRef,
        name: &str,
        aliases: &[String],
    ) -> SessionResult<bool> {
        self.configure_common()?;
        let key = canonical_name(name);
        {
            let mut factories = self.factories.write();
            if factories.contains_key(&key) {
                debug!(backend = %key, "Backend already registered");
                return Ok(false);
            }
            factories.add(&key, factory)?;
        }
        {
            let mut table = self.aliases.write();
            for alias in aliases {
                table.add(alias.as_str(), key.as_str());
            }
        }
        info!(backend = %key, aliases = ?aliases, "Session factory registered");
        Ok(true)
    }

    /// Build and register a factory from a backend definition.
    ///
    /// An empty `name` falls back to the definition's own name. Returns `false` if
    /// the backend was already registered.
    pub async fn add_backend(
        &self,
        definition: &BackendDefinition,
        name: &str,
        aliases: &[String],
    ) -> SessionResult<bool> {
        let name = if name.is_empty() {
            definition.name.as_str()
        } else {
            name
        };
        let key = canonical_name(name);
        if self.factories.read().contains_key(&key) {
            debug!(backend = %key, "Backend already registered");
            return Ok(false);
        }

        let factory = self.builder.build(definition).await.map_err(|e| {
            SessionError::config_with(format!("Unable to build session factory '{}'", key), e)
        })?;

        let mut all_aliases = aliases.to_vec();
        all_aliases.extend(definition.aliases.iter().cloned());
        let added = self
            .add_session_factory(Arc::clone(&factory), &key, &all_aliases)
            .map_err(|e| {
                SessionError::config_with(format!("Unable to register session factory '{}'", key), e)
            })?;
        if !added {
            factory.close().await;
        }
        Ok(added)
    }

    /// Load aliases and the default interceptor type from settings, once.
    fn configure_common(&self) -> SessionResult<()> {
        let mut loaded = self.common_loaded.lock();
        if *loaded {
            return Ok(());
        }
        let (aliases, interceptor) = {
            let settings = self.settings.read();
            (settings.aliases.clone(), settings.interceptor.clone())
        };

        if let Some(type_id) = interceptor.filter(|t| !t.trim().is_empty()) {
            let type_id = type_id.trim().to_string();
            if !self.interceptors.contains(&type_id) {
                return Err(SessionError::config(format!(
                    "Unknown interceptor type '{}'",
                    type_id
                )));
            }
            *self.interceptor_type.write() = Some(type_id);
        }
        if let Some(spec) = aliases {
            self.add_aliases(&spec);
        }
        *loaded = true;
        debug!("Common session settings loaded");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    async fn ensure_configured(&self) -> SessionResult<()> {
        match self.state() {
            ConfigState::Configured => Ok(()),
            ConfigState::Configuring => self.configure().await,
            ConfigState::Unconfigured if self.factories.read().is_empty() => self.configure().await,
            // A configuration run may have started between the two reads.
            ConfigState::Unconfigured => match self.state() {
                ConfigState::Unconfigured => Ok(()),
                _ => self.configure().await,
            },
        }
    }

    /// Register backends from the configured sources.
    ///
    /// Sources are tried in order and the first one that registers a backend
    /// wins: definition files, named definitions, the legacy entry, the default
    /// definition file in the base directory, then the ambient default. Safe to
    /// call concurrently; only one caller does the work. On failure the manager
    /// stays unconfigured and the call may be retried.
    pub async fn configure(&self) -> SessionResult<()> {
        if self.configured.load(Ordering::Acquire) {
            return Ok(());
        }
        let _lock = self.configure_lock.lock().await;
        if self.configured.load(Ordering::Acquire) {
            return Ok(());
        }

        *self.state.lock() = ConfigState::Configuring;
        match self.run_configuration().await {
            Ok(registered) => {
                *self.state.lock() = ConfigState::Configured;
                self.configured.store(true, Ordering::Release);
                info!(
                    registered,
                    backends = ?self.backend_names(),
                    "Session factories configured"
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ConfigState::Unconfigured;
                Err(SessionError::config_with(
                    "Unable to configure session factories",
                    e,
                ))
            }
        }
    }

    async fn run_configuration(&self) -> SessionResult<usize> {
        self.configure_common()?;
        let settings = self.settings.read().clone();

        let mut registered = self.register_files(&settings.config_file_paths()).await?;

        if registered == 0 {
            for definition in &settings.backends {
                if self.add_backend(definition, "", &[]).await? {
                    registered += 1;
                }
            }
        }

        if registered == 0 {
            if let Some(definition) = &settings.legacy {
                if self.add_backend(definition, "", &[]).await? {
                    registered += 1;
                }
            }
        }

        if registered == 0 {
            let default_file = settings.default_config_file();
            if default_file.is_file() {
                registered += self.register_files(&[default_file]).await?;
            }
        }

        if registered == 0 && self.factories.read().is_empty() {
            if let Some(definition) = settings.ambient_default()? {
                debug!("Falling back to ambient default backend");
                if self.add_backend(&definition, "", &[]).await? {
                    registered += 1;
                }
            }
        }

        if self.factories.read().is_empty() {
            return Err(SessionError::config(
                "No session factories configured and no default could be found",
            ));
        }
        Ok(registered)
    }

    async fn register_files(&self, paths: &[PathBuf]) -> SessionResult<usize> {
        let mut registered = 0;
        for path in paths {
            if !path.exists() {
                debug!(path = %path.display(), "Backend definition file not found; skipping");
                continue;
            }
            let definition = BackendDefinition::from_file(path)?;
            if self.add_backend(&definition, "", &[]).await? {
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Register backends from a semicolon-separated list of definition files
    /// and remember the list for later `configure` calls.
    pub async fn configure_files(&self, paths: &str) -> SessionResult<usize> {
        let resolved = {
            let mut settings = self.settings.write();
            settings.config_files = Some(paths.to_string());
            settings.config_file_paths()
        };
        self.configure_common()
            .map_err(|e| SessionError::config_with("Unable to configure session factories", e))?;
        self.register_files(&resolved)
            .await
            .map_err(|e| SessionError::config_with(format!("Unable to configure from '{}'", paths), e))
    }

    /// Register a single backend from an explicit definition.
    pub async fn configure_with(
        &self,
        definition: &BackendDefinition,
        name: &str,
        aliases: &[String],
    ) -> SessionResult<bool> {
        self.add_backend(definition, name, aliases).await
    }

    /// Close every registered factory and forget them.
    ///
    /// The manager returns to the unconfigured state.
    pub async fn close_factories(&self) {
        let _lock = self.configure_lock.lock().await;
        let factories: Vec<(String, FactoryRef)> = {
            let mut table = self.factories.write();
            let keys: Vec<String> = table.keys().map(str::to_string).collect();
            keys.into_iter()
                .filter_map(|key| table.remove(&key).map(|factory| (key, factory)))
                .collect()
        };
        for (key, factory) in factories {
            factory.close().await;
            debug!(backend = %key, "Session factory closed");
        }
        *self.state.lock() = ConfigState::Unconfigured;
        self.configured.store(false, Ordering::Release);
        info!("All session factories closed");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("scope_kind", &self.scope_kind)
            .field("state", &self.state())
            .field("backends", &self.backend_names())
            .field("aliases", &self.aliases.read().len())
            .field("request_hook_installed", &self.request_hook_installed())
            .finish()
    }
}
