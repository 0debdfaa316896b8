//! Last-resort configuration from DATABASE_URL.
//!
//! Everything runs in one test because the environment is process-wide; this
//! file gets its own test binary so no other test observes the variable.

mod common;

use common::{fake, fake_manager_with};
use db_session_scope::config::{AMBIENT_URL_ENV, Settings};
use db_session_scope::error::SessionError;
use db_session_scope::scope::{ScopeKind, WorkerScope};
use db_session_scope::session::ConfigState;
use std::error::Error;
use std::path::Path;

fn ambient_settings(base_dir: &Path) -> Settings {
    Settings {
        base_dir: base_dir.to_path_buf(),
        ambient_lookup: true,
        ..Settings::default()
    }
}

fn error_chain(err: &SessionError) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

fn set_ambient_url(value: &str) {
    // SAFETY: this binary runs a single test, so nothing reads the environment concurrently.
    unsafe { std::env::set_var(AMBIENT_URL_ENV, value) };
}

#[tokio::test]
async fn test_ambient_default_is_last_resort() {
    let dir = tempfile::tempdir().unwrap();

    // A malformed value aborts configuration and keeps the parse failure as the cause.
    set_ambient_url("oracle://host/db");
    let (manager, state) = fake_manager_with(ScopeKind::Worker, ambient_settings(dir.path()));
    let err = manager.configure().await.unwrap_err();
    assert!(matches!(err, SessionError::Config { .. }));
    let chain = error_chain(&err);
    assert!(
        chain.iter().any(|m| m.contains("Unsupported database scheme")),
        "{chain:?}"
    );
    assert_eq!(manager.state(), ConfigState::Unconfigured);
    assert_eq!(state.built(), 0);

    // With every other source empty, a valid value registers the default backend.
    set_ambient_url("sqlite::memory:");
    manager.configure().await.unwrap();
    assert_eq!(manager.state(), ConfigState::Configured);
    assert_eq!(manager.backend_names(), vec![String::new()]);
    assert_eq!(state.built(), 1);

    let scope = WorkerScope::new("w1");
    let session = manager.get_session(&scope, "").await.unwrap();
    assert!(session.is_open());
    manager.close_all_sessions(&scope).await.unwrap();

    // Any earlier source wins over the environment.
    let (manager, _state) = fake_manager_with(
        ScopeKind::Worker,
        Settings {
            backends: vec![fake("orders")],
            ..ambient_settings(dir.path())
        },
    );
    manager.configure().await.unwrap();
    assert_eq!(manager.backend_names(), vec!["ORDERS"]);

    // Without the opt-in the variable is ignored.
    let (manager, _state) = fake_manager_with(
        ScopeKind::Worker,
        Settings {
            base_dir: dir.path().to_path_buf(),
            ..Settings::default()
        },
    );
    assert!(matches!(
        manager.configure().await,
        Err(SessionError::Config { .. })
    ));
}
