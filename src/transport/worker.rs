//! Worker mode.
//!
//! Spawns one worker per registered backend. Each worker owns a `WorkerScope`,
//! runs a probe statement inside a guarded transaction, and reports the outcome.

use crate::error::{SessionError, SessionResult};
use crate::scope::WorkerScope;
use crate::session::SessionManager;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Statement used to probe a backend.
pub const PROBE_SQL: &str = "SELECT 1";

/// Outcome of probing one backend.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub backend: String,
    pub worker: String,
    pub session_id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct WorkerRunner {
    manager: Arc<SessionManager>,
}

impl WorkerRunner {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Probe every registered backend concurrently, one worker scope each.
    pub async fn probe_all(&self) -> SessionResult<Vec<ProbeReport>> {
        self.manager.configure().await?;

        let mut handles = Vec::new();
        for backend in self.manager.backend_names() {
            let manager = Arc::clone(&self.manager);
            handles.push(tokio::spawn(async move {
                let scope = WorkerScope::new(format!("worker-{}", backend.to_lowercase()));
                let report = probe(&manager, &scope, &backend).await;
                scope.recycle();
                report
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            let report = handle
                .await
                .map_err(|e| SessionError::internal(format!("Worker task failed: {}", e)))?;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Open a session in `scope`, run the probe in a transaction and commit it.
pub async fn probe(manager: &SessionManager, scope: &WorkerScope, backend: &str) -> ProbeReport {
    let result = async {
        let guard = manager.transaction(scope, backend, None).await?;
        let session_id = guard.session().id().to_string();
        guard.session().execute(PROBE_SQL).await?;
        guard.commit().await?;
        Ok::<_, SessionError>(session_id)
    }
    .await;

    if let Err(e) = manager.close_all_sessions(scope).await {
        error!(backend = %backend, error = %e, "Failed to close worker sessions");
    }

    match result {
        Ok(session_id) => ProbeReport {
            backend: backend.to_string(),
            worker: scope.worker().to_string(),
            session_id: Some(session_id),
            ok: true,
            error: None,
        },
        Err(e) => ProbeReport {
            backend: backend.to_string(),
            worker: scope.worker().to_string(),
            session_id: None,
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

impl Transport for WorkerRunner {
    async fn run(&self) -> SessionResult<()> {
        info!("Running worker probes");
        let reports = self.probe_all().await?;
        let failed = reports.iter().filter(|r| !r.ok).count();

        for report in &reports {
            let line = serde_json::to_string(report)
                .map_err(|e| SessionError::internal(format!("Failed to encode report: {}", e)))?;
            println!("{line}");
        }
        self.manager.close_factories().await;

        if failed > 0 {
            return Err(SessionError::internal(format!(
                "{} of {} backend probes failed",
                failed,
                reports.len()
            )));
        }
        info!(backends = reports.len(), "All backend probes succeeded");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "worker"
    }
}
