//! Structured error types for the sqlq query layer.
//!
//! Drivers translate their native errors into these variants so callers can
//! classify failures (timeout, absence, constraint, fatal) without knowing
//! which store sits underneath.

use thiserror::Error;

/// Main error type for sqlq operations
#[derive(Error, Debug)]
pub enum DbError {
    /// The resolved context deadline passed before the operation finished
    #[error("context deadline exceeded")]
    Timeout,

    /// The resolved context was cancelled by its owner
    #[error("context canceled")]
    Canceled,

    /// The store gave up waiting for a row or table lock
    #[error("lock timeout: {message}")]
    LockTimeout { message: String },

    /// The store cancelled the statement (statement timeout or cancel request)
    #[error("query canceled by server: {message}")]
    QueryCanceled { message: String },

    /// Failure acquiring or using a connection
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Store-reported integrity constraint failure
    #[error("constraint violation ({code}{}): {message}", .constraint.as_deref().map(|c| format!(", {c}")).unwrap_or_default())]
    Constraint {
        code: String,
        constraint: Option<String>,
        message: String,
    },

    /// The query matched zero rows
    #[error("no rows in result set")]
    NoRows,

    /// A column value could not be converted to the requested type
    #[error("failed to decode column '{column}': {reason}")]
    Decode { column: String, reason: String },

    /// Any other store-reported error
    #[error("database error{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Database {
        code: Option<String>,
        message: String,
    },

    /// A timeout policy value is out of range
    #[error("invalid timeout policy: {reason}")]
    InvalidPolicy { reason: String },

    /// Two explicit queryers were supplied to the same wrapper
    #[error("queryer already set")]
    QueryerAlreadySet,

    /// A named statement referenced an argument the caller did not supply
    #[error("missing named argument ':{name}'")]
    MissingNamedArg { name: String },

    /// The named statement or its argument source is malformed
    #[error("invalid named query: {reason}")]
    InvalidNamedQuery { reason: String },

    /// Applying the session timeouts right after BEGIN failed
    #[error("error setting transaction timeouts: {source}")]
    TransactionSetup {
        #[source]
        source: Box<DbError>,
    },

    /// Rollback failed after a callback error; the connection state is unknown
    #[error("rollback failed after '{cause}': {source}")]
    RollbackFailed {
        #[source]
        source: Box<DbError>,
        cause: String,
    },
}

/// Result type alias for sqlq operations
pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a decode error for a column
    pub fn decode(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Create a generic database error
    pub fn database(code: Option<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid named query error
    pub fn invalid_named_query(reason: impl Into<String>) -> Self {
        Self::InvalidNamedQuery {
            reason: reason.into(),
        }
    }

    /// Wrap a failure from the post-BEGIN timeout statement
    pub fn transaction_setup(source: DbError) -> Self {
        Self::TransactionSetup {
            source: Box::new(source),
        }
    }

    /// Wrap a failed rollback together with what triggered it
    pub fn rollback_failed(source: DbError, cause: impl Into<String>) -> Self {
        Self::RollbackFailed {
            source: Box::new(source),
            cause: cause.into(),
        }
    }

    /// Deadline, lock wait or server-side cancellation.
    ///
    /// Retrying is only safe when the operation is idempotent.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::LockTimeout { .. } | Self::QueryCanceled { .. }
        )
    }

    /// Query matched nothing; callers usually treat this as a normal outcome.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::NoRows)
    }

    /// Constraint identifier reported by the store, if any.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Self::Constraint { constraint, .. } => constraint.as_deref(),
            _ => None,
        }
    }

    /// The connection's transactional state is unknown.
    ///
    /// Abort the request and never reuse the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}
