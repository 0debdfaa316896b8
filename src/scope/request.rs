//! Request-local scope storage.
//!
//! A `RequestContext` is created once per inbound request and carries an opaque
//! property bag. The session map and start mode are stored in that bag on first
//! access, so every clone of the context (including ones moved into tasks spawned
//! while handling the request) sees the same sessions. When the last clone is
//! dropped the storage goes with it.
//!
//! Code running within one request is expected to be a single logical flow; the
//! bag lock keeps each access atomic but does not order interleaved callers.

use super::{ScopeKind, ScopeRegistry, SessionMap, SessionMode};
use crate::error::SessionResult;
use crate::session::SessionRef;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

const SESSIONS_KEY: &str = "session_scope.sessions";
const START_MODE_KEY: &str = "session_scope.start_mode";

type PropertyBag = HashMap<&'static str, Box<dyn Any + Send + Sync>>;

/// Ambient per-request context with a property bag.
#[derive(Clone)]
pub struct RequestContext {
    id: String,
    items: Arc<Mutex<PropertyBag>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            items: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store a property, replacing any previous value under `key`.
    pub fn insert<T: Any + Send + Sync>(&self, key: &'static str, value: T) {
        self.items.lock().insert(key, Box::new(value));
    }

    /// Read a copy of a property, if present with the expected type.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &'static str) -> Option<T> {
        self.items
            .lock()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, key: &'static str) -> bool {
        self.items.lock().contains_key(key)
    }

    /// Run `f` against the property under `key`, creating it with `T::default()`
    /// if it is missing or holds a value of another type.
    pub fn with_item<T, R>(&self, key: &'static str, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Sync + Default,
    {
        let mut items = self.items.lock();
        let mut value: Box<T> = items
            .remove(key)
            .and_then(|existing| existing.downcast::<T>().ok())
            .unwrap_or_default();
        let result = f(&mut value);
        items.insert(key, value);
        result
    }

    /// Whether two handles refer to the same request.
    pub fn same_request(&self, other: &RequestContext) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("items", &self.items.lock().len())
            .finish()
    }
}

/// Scope registry view over a request's property bag.
#[derive(Clone, Debug)]
pub struct RequestScope {
    context: RequestContext,
}

impl RequestScope {
    pub fn new(context: RequestContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    fn with_sessions<R>(&self, f: impl FnOnce(&mut SessionMap) -> R) -> R {
        self.context.with_item::<SessionMap, R>(SESSIONS_KEY, f)
    }
}

impl ScopeRegistry for RequestScope {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Request
    }

    fn get(&self, name: &str) -> SessionResult<SessionRef> {
        self.with_sessions(|sessions| sessions.get(name))
    }

    fn add(&self, name: &str, session: SessionRef) -> SessionResult<()> {
        self.with_sessions(|sessions| sessions.add(name, session))
    }

    fn remove(&self, name: &str) -> Option<SessionRef> {
        self.with_sessions(|sessions| sessions.remove(name))
    }

    fn contains_key(&self, name: &str) -> bool {
        self.with_sessions(|sessions| sessions.contains_key(name))
    }

    fn session_mode(&self) -> SessionMode {
        self.context
            .get::<SessionMode>(START_MODE_KEY)
            .unwrap_or_default()
    }

    fn set_session_mode(&self, mode: SessionMode) {
        self.context.insert(START_MODE_KEY, mode);
    }

    fn entries(&self) -> Vec<(String, SessionRef)> {
        self.with_sessions(|sessions| sessions.entries())
    }

    fn len(&self) -> usize {
        self.with_sessions(|sessions| sessions.len())
    }
}
