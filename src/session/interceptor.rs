//! Interceptor resolution.
//!
//! Configuration names an interceptor by a type identifier string. Identifiers are
//! mapped to constructors registered ahead of time; `tracing` is always available.

use super::Interceptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Identifier of the built-in statement-logging interceptor.
pub const TRACING_INTERCEPTOR: &str = "tracing";

type InterceptorCtor = Arc<dyn Fn() -> Arc<dyn Interceptor> + Send + Sync>;

/// Logs every prepared statement at debug level.
#[derive(Debug, Default)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn on_session_open(&self, session_id: &str) {
        debug!(session_id = %session_id, "Session opened");
    }

    fn on_prepare_statement(&self, sql: &str) -> String {
        debug!(sql = %sql, "Preparing statement");
        sql.to_string()
    }
}

/// Name → constructor table for interceptor type identifiers.
pub struct InterceptorRegistry {
    ctors: RwLock<HashMap<String, InterceptorCtor>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        let registry = Self {
            ctors: RwLock::new(HashMap::new()),
        };
        registry.register(TRACING_INTERCEPTOR, || Arc::new(TracingInterceptor));
        registry
    }

    /// Register a constructor. A later registration under the same name replaces it.
    pub fn register<F>(&self, type_id: impl Into<String>, ctor: F)
    where
        F: Fn() -> Arc<dyn Interceptor> + Send + Sync + 'static,
    {
        self.ctors.write().insert(type_id.into(), Arc::new(ctor));
    }

    /// Instantiate the interceptor registered under `type_id`.
    ///
    /// Unknown identifiers yield `None`.
    pub fn create(&self, type_id: &str) -> Option<Arc<dyn Interceptor>> {
        let ctor = self.ctors.read().get(type_id).cloned()?;
        Some(ctor())
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.ctors.read().contains_key(type_id)
    }
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.ctors.read().keys().cloned().collect();
        f.debug_struct("InterceptorRegistry")
            .field("types", &names)
            .finish()
    }
}
