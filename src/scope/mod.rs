//! Scoped session storage.
//!
//! A scope holds at most one open session per backend. Two strategies share the
//! `ScopeRegistry` contract:
//! - `WorkerScope`: storage owned by one worker (thread or task)
//! - `RequestScope`: storage kept in the property bag of an inbound request's
//!   `RequestContext`, visible to everything running within that request
//!
//! The strategy is chosen once when the `SessionManager` is constructed.

pub mod request;
pub mod worker;

pub use request::{RequestContext, RequestScope};
pub use worker::WorkerScope;

use crate::error::{SessionError, SessionResult};
use crate::session::SessionRef;
use clap::ValueEnum;
use std::collections::HashMap;
use std::fmt;

/// Why the first session in a scope was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Unknown,
    /// Opened explicitly by application code.
    Manual,
    /// Opened implicitly by `begin_transaction`; completing the transaction closes it.
    AutoTransactionScope,
    /// Opened within a request managed by the request hook.
    HttpRequest,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Manual => write!(f, "manual"),
            Self::AutoTransactionScope => write!(f, "auto-transaction"),
            Self::HttpRequest => write!(f, "http-request"),
        }
    }
}

/// Which scope storage strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ScopeKind {
    /// One scope per worker thread or task
    #[default]
    Worker,
    /// One scope per inbound request
    Request,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Request => write!(f, "request"),
        }
    }
}

/// Backend name → open session map confined to one logical scope.
pub trait ScopeRegistry: Send + Sync {
    fn kind(&self) -> ScopeKind;

    /// Fails with `NotFound` if no session is held for `name`.
    fn get(&self, name: &str) -> SessionResult<SessionRef>;

    /// Fails with `DuplicateKey` if a session is already held for `name`.
    fn add(&self, name: &str, session: SessionRef) -> SessionResult<()>;

    /// Remove the entry if present.
    fn remove(&self, name: &str) -> Option<SessionRef>;

    fn contains_key(&self, name: &str) -> bool;

    fn session_mode(&self) -> SessionMode;

    fn set_session_mode(&self, mode: SessionMode);

    /// Snapshot of all `(name, session)` pairs. Order is unspecified.
    fn entries(&self) -> Vec<(String, SessionRef)>;

    fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(name, _)| name).collect()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Session map shared by both strategies.
#[derive(Default, Clone)]
pub(crate) struct SessionMap {
    sessions: HashMap<String, SessionRef>,
}

impl SessionMap {
    pub(crate) fn get(&self, name: &str) -> SessionResult<SessionRef> {
        self.sessions
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::not_found(name))
    }

    pub(crate) fn add(&mut self, name: &str, session: SessionRef) -> SessionResult<()> {
        if self.sessions.contains_key(name) {
            return Err(SessionError::duplicate_key(name));
        }
        self.sessions.insert(name.to_string(), session);
        Ok(())
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<SessionRef> {
        self.sessions.remove(name)
    }

    pub(crate) fn contains_key(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub(crate) fn entries(&self) -> Vec<(String, SessionRef)> {
        self.sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, SessionRef)> {
        self.sessions.drain().collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StubSession;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_session_mode_default_unknown() {
        assert_eq!(SessionMode::default(), SessionMode::Unknown);
        assert_eq!(SessionMode::AutoTransactionScope.to_string(), "auto-transaction");
    }

    #[test]
    fn test_scope_kind_display() {
        assert_eq!(ScopeKind::Worker.to_string(), "worker");
        assert_eq!(ScopeKind::Request.to_string(), "request");
    }

    #[test]
    fn test_session_map_contract() {
        let mut map = SessionMap::default();
        assert!(matches!(map.get("A"), Err(SessionError::NotFound { .. })));

        map.add("A", StubSession::new("s1")).unwrap();
        let err = map.add("A", StubSession::new("s2")).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateKey { .. }));
        assert_eq!(map.get("A").unwrap().id(), "s1");

        assert!(map.remove("A").is_some());
        assert!(map.remove("A").is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_session_map_entries_share_handles() {
        let mut map = SessionMap::default();
        let session = StubSession::new("s1");
        map.add("A", session.clone()).unwrap();
        let entries = map.entries();
        assert_eq!(entries.len(), 1);
        let held: SessionRef = session;
        assert!(Arc::ptr_eq(&entries[0].1, &held));
    }
}
