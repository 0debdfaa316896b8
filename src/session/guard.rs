//! Transaction guard.
//!
//! A `TransactionGuard` is returned by `SessionManager::transaction`. Consuming it
//! with `commit` or `rollback` completes the transaction; dropping it while the
//! transaction is still active rolls the transaction back.

use super::manager::SessionManager;
use super::{SessionRef, TransactionRef};
use crate::error::{SessionError, SessionResult};
use crate::scope::{ScopeRegistry, SessionMode};
use tracing::warn;

#[must_use = "dropping the guard rolls the transaction back"]
pub struct TransactionGuard<'a> {
    manager: &'a SessionManager,
    scope: &'a dyn ScopeRegistry,
    name: String,
    session: SessionRef,
    transaction: TransactionRef,
}

impl<'a> TransactionGuard<'a> {
    pub(crate) fn new(
        manager: &'a SessionManager,
        scope: &'a dyn ScopeRegistry,
        name: String,
        session: SessionRef,
        transaction: TransactionRef,
    ) -> Self {
        Self {
            manager,
            scope,
            name,
            session,
            transaction,
        }
    }

    /// Canonical backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    pub fn transaction(&self) -> &TransactionRef {
        &self.transaction
    }

    /// Commit the transaction.
    ///
    /// If the commit fails the transaction is rolled back before the error is
    /// returned as `SessionError::Fatal` wrapping the cause.
    pub async fn commit(self) -> SessionResult<()> {
        let cause = match self.manager.commit_transaction(self.scope, &self.name).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if let Err(e) = self.manager.rollback_transaction(self.scope, &self.name).await {
            warn!(
                backend = %self.name,
                session_id = %self.session.id(),
                error = %e,
                "Rollback after failed commit did not complete"
            );
        }
        if self.transaction.is_active() {
            self.transaction.start_rollback();
        }
        Err(SessionError::fatal_with(
            "Commit failed; transaction rolled back",
            cause,
        ))
    }

    pub async fn rollback(self) -> SessionResult<()> {
        self.manager.rollback_transaction(self.scope, &self.name).await
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.session.is_open() || !self.transaction.is_active() {
            return;
        }
        warn!(
            backend = %self.name,
            session_id = %self.session.id(),
            "Transaction guard released without commit or rollback; rolling back"
        );
        self.transaction.start_rollback();
        if self.scope.session_mode() == SessionMode::AutoTransactionScope {
            self.manager
                .discard_session(self.scope, &self.name, &self.session);
        }
    }
}

impl std::fmt::Debug for TransactionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionGuard")
            .field("name", &self.name)
            .field("session_id", &self.session.id())
            .field("active", &self.transaction.is_active())
            .finish()
    }
}
