//! Worker-local scope storage.
//!
//! Each worker creates its own `WorkerScope` and passes it to the session manager.
//! Nothing is shared between workers, so the inner lock is never contended; it only
//! exists so the scope can be held across `.await` points on a multi-threaded runtime.

use super::{ScopeKind, ScopeRegistry, SessionMap, SessionMode};
use crate::error::SessionResult;
use crate::session::SessionRef;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Default)]
struct WorkerState {
    sessions: SessionMap,
    mode: SessionMode,
}

pub struct WorkerScope {
    worker: String,
    state: Mutex<WorkerState>,
}

impl WorkerScope {
    /// Create a scope labelled with the given worker name.
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            state: Mutex::new(WorkerState::default()),
        }
    }

    /// Create a scope labelled after the calling thread.
    pub fn for_current_thread() -> Self {
        let thread = std::thread::current();
        let label = match thread.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", thread.id()),
        };
        Self::new(label)
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Reset the scope for reuse by a new unit of work.
    ///
    /// Entries are dropped without being closed; callers should close sessions
    /// through the manager first.
    pub fn recycle(&self) {
        let mut state = self.state.lock();
        let leftover = state.sessions.drain();
        if !leftover.is_empty() {
            let names: Vec<&str> = leftover.iter().map(|(name, _)| name.as_str()).collect();
            warn!(
                worker = %self.worker,
                backends = ?names,
                "Recycling worker scope with sessions still registered"
            );
        }
        state.mode = SessionMode::Unknown;
        debug!(worker = %self.worker, "Worker scope recycled");
    }
}

impl ScopeRegistry for WorkerScope {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Worker
    }

    fn get(&self, name: &str) -> SessionResult<SessionRef> {
        self.state.lock().sessions.get(name)
    }

    fn add(&self, name: &str, session: SessionRef) -> SessionResult<()> {
        self.state.lock().sessions.add(name, session)
    }

    fn remove(&self, name: &str) -> Option<SessionRef> {
        self.state.lock().sessions.remove(name)
    }

    fn contains_key(&self, name: &str) -> bool {
        self.state.lock().sessions.contains_key(name)
    }

    fn session_mode(&self) -> SessionMode {
        self.state.lock().mode
    }

    fn set_session_mode(&self, mode: SessionMode) {
        self.state.lock().mode = mode;
    }

    fn entries(&self) -> Vec<(String, SessionRef)> {
        self.state.lock().sessions.entries()
    }

    fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkerScope")
            .field("worker", &self.worker)
            .field("sessions", &state.sessions.len())
            .field("mode", &state.mode)
            .finish()
    }
}
