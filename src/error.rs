//! Error types for the gateway.
//!
//! This module defines all error types using `thiserror`. Every variant renders
//! a human-readable message because surfaced errors end up verbatim in the
//! `message` field of an error result returned to the HTTP client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("Alias '{alias}' is missing")]
    UnknownAlias { alias: String },

    #[error("Timed out after {waited_ms}ms waiting for a connection from '{alias}'")]
    PoolTimeout { alias: String, waited_ms: u64 },

    #[error("No connection available from '{alias}'")]
    ConnectionUnavailable { alias: String },

    #[error("Cannot create connection for '{alias}': {message}")]
    DatabaseUnavailable { alias: String, message: String },

    #[error("{message}")]
    Statement {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("The alias '{alias}' is already defined")]
    AliasAlreadyDefined { alias: String },

    #[error("Config error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a malformed request error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Create an unknown alias error.
    pub fn unknown_alias(alias: impl Into<String>) -> Self {
        Self::UnknownAlias {
            alias: alias.into(),
        }
    }

    /// Create a pool timeout error.
    pub fn pool_timeout(alias: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolTimeout {
            alias: alias.into(),
            waited_ms,
        }
    }

    /// Create a connection unavailable error.
    pub fn connection_unavailable(alias: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            alias: alias.into(),
        }
    }

    /// Create a database unavailable error (connection creation failed).
    pub fn database_unavailable(alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseUnavailable {
            alias: alias.into(),
            message: message.into(),
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an alias already defined error.
    pub fn alias_already_defined(alias: impl Into<String>) -> Self {
        Self::AliasAlreadyDefined {
            alias: alias.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is a transient pool condition worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout { .. } | Self::ConnectionUnavailable { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
///
/// Only errors raised while executing statements reach this conversion;
/// connection creation failures are mapped to `DatabaseUnavailable` by the
/// connector, which knows the alias.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::statement(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::statement("No rows returned", None),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::statement(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::Io(io_err) => DbError::statement(format!("I/O error: {}", io_err), None),
            sqlx::Error::Protocol(msg) => {
                DbError::statement(format!("Protocol error: {}", msg), None)
            }
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            other => DbError::statement(other.to_string(), None),
        }
    }
}

/// JSON errors only come from decoding an incoming batch.
impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::malformed(err.to_string())
    }
}

/// Result type alias for gateway operations.
pub type DbResult<T> = Result<T, DbError>;
