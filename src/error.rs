//! Error types for the session scope manager.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Registry and table lookups fail with `NotFound` / `DuplicateKey`; configuration and
//! registration failures are wrapped as `Config` with the original cause preserved;
//! operations attempted without an active session or transaction fail with `Fatal`.

use thiserror::Error;

/// Boxed underlying cause carried by wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Backend not found: '{name}'")]
    NotFound { name: String },

    #[error("Scope already holds a session for backend '{name}'")]
    DuplicateKey { name: String },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Fatal: {message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    /// Create a not-found error for a backend name or alias.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a duplicate-key error for a scope entry.
    pub fn duplicate_key(name: impl Into<String>) -> Self {
        Self::DuplicateKey { name: name.into() }
    }

    /// Create a configuration error without an underlying cause.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying cause as a configuration error.
    pub fn config_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a fatal error without an underlying cause.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying cause as a fatal error.
    pub fn fatal_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Fatal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A failed `configure()` leaves the manager unconfigured, so configuration
    /// errors may be retried as well.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Config { .. })
    }
}

/// Convert sqlx errors to SessionError.
impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => SessionError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                SessionError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => SessionError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => SessionError::connection(
                "Timed out acquiring a connection from the pool",
                "Close idle sessions or raise max_connections",
            ),
            sqlx::Error::PoolClosed => {
                SessionError::connection("Connection pool is closed", "Reconfigure the backend")
            }
            sqlx::Error::Io(io_err) => SessionError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => SessionError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => SessionError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => SessionError::internal("Database worker crashed"),
            _ => SessionError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = SessionError::not_found("REPORTS");
        assert_eq!(err.to_string(), "Backend not found: 'REPORTS'");

        let err = SessionError::duplicate_key("MAIN");
        assert!(err.to_string().contains("MAIN"));
    }

    #[test]
    fn test_config_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err = SessionError::config_with("Unable to read backend definition", io);
        assert!(err.to_string().contains("Unable to read backend definition"));
        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "missing file");
    }

    #[test]
    fn test_fatal_error_wraps_session_error() {
        let inner = SessionError::database("disk full", None, "free some space");
        let err = SessionError::fatal_with("Commit failed; transaction rolled back", inner);
        assert!(matches!(err, SessionError::Fatal { .. }));
        assert!(err.source().unwrap().to_string().contains("disk full"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = SessionError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(SessionError::fatal("no transaction").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(SessionError::connection("err", "sugg").is_retryable());
        assert!(SessionError::config("no sources").is_retryable());
        assert!(!SessionError::not_found("x").is_retryable());
        assert!(!SessionError::fatal("no transaction").is_retryable());
    }

    #[test]
    fn test_pool_closed_maps_to_connection() {
        let err: SessionError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, SessionError::Connection { .. }));
    }
}
