//! Database flavours and their transaction-control dialects.

use crate::session::IsolationLevel;
use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Statements that open a transaction, in execution order.
    ///
    /// `read_only` requests a read-only transaction where the dialect supports one;
    /// SQLite enforces read-only access at the connection level instead.
    pub fn begin_statements(
        &self,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> Vec<String> {
        match self {
            Self::PostgreSQL => {
                let mut sql = String::from("BEGIN");
                if let Some(level) = isolation {
                    sql.push_str(" ISOLATION LEVEL ");
                    sql.push_str(level.as_sql());
                }
                if read_only {
                    sql.push_str(" READ ONLY");
                }
                vec![sql]
            }
            Self::MySQL => {
                let mut statements = Vec::with_capacity(2);
                if let Some(level) = isolation {
                    statements.push(format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()));
                }
                statements.push(if read_only {
                    "START TRANSACTION READ ONLY".to_string()
                } else {
                    "START TRANSACTION".to_string()
                });
                statements
            }
            // SQLite is always serializable; IMMEDIATE takes the write lock up front.
            Self::SQLite => match isolation {
                Some(IsolationLevel::Serializable | IsolationLevel::RepeatableRead) => {
                    vec!["BEGIN IMMEDIATE".to_string()]
                }
                _ => vec!["BEGIN DEFERRED".to_string()],
            },
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
