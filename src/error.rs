//! Error types for the SQL bridge.
//!
//! Every failure crossing the bridge boundary is a [`DbError`]. Native driver
//! errors are flattened into it (message and SQLSTATE are kept, the driver's
//! own error type is not), so the embedding runtime only ever has to reason
//! about [`ErrorKind`].

use std::time::Duration;
use thiserror::Error;

/// Coarse error taxonomy the embedding runtime can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownDriver,
    DriverConflict,
    InvalidDataSource,
    InvalidOption,
    HandleClosed,
    InvalidArgument,
    UnsupportedType,
    ConversionError,
    Timeout,
    Unsupported,
    Driver,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Unknown driver: {driver}")]
    UnknownDriver { driver: String },

    #[error("Driver '{driver}' is already registered with a different implementation")]
    DriverConflict { driver: String },

    #[error("Invalid data source for driver '{driver}': {message}")]
    InvalidDataSource { driver: String, message: String },

    #[error("Invalid option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("Database handle is closed")]
    HandleClosed,

    /// `position` is 1-based, matching placeholder numbering.
    #[error("Invalid argument at position {position}: {message}")]
    InvalidArgument { position: usize, message: String },

    #[error("Unsupported type '{type_name}' in column '{column}'")]
    UnsupportedType { column: String, type_name: String },

    #[error("Failed to convert column '{column}': {message}")]
    ConversionError { column: String, message: String },

    #[error("Timeout: {operation} exceeded {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Unsupported by driver '{driver}': {capability}")]
    Unsupported { driver: String, capability: String },

    #[error("Database error: {message}")]
    Driver {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
    },

    /// Runtime failure annotated with the statement that produced it.
    #[error("{source} (statement: {statement})")]
    Statement {
        statement: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create an unknown driver error.
    pub fn unknown_driver(driver: impl Into<String>) -> Self {
        Self::UnknownDriver {
            driver: driver.into(),
        }
    }

    /// Create a driver conflict error.
    pub fn driver_conflict(driver: impl Into<String>) -> Self {
        Self::DriverConflict {
            driver: driver.into(),
        }
    }

    /// Create an invalid data source error.
    pub fn invalid_data_source(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDataSource {
            driver: driver.into(),
            message: message.into(),
        }
    }

    /// Create an invalid option error.
    pub fn invalid_option(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Create an invalid argument error for a 1-based parameter position.
    pub fn invalid_argument(position: usize, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            position,
            message: message.into(),
        }
    }

    /// Create an unsupported column type error.
    pub fn unsupported_type(column: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            column: column.into(),
            type_name: type_name.into(),
        }
    }

    /// Create a row conversion error.
    pub fn conversion(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConversionError {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create an unsupported capability error.
    pub fn unsupported(driver: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::Unsupported {
            driver: driver.into(),
            capability: capability.into(),
        }
    }

    /// Create a passthrough driver error.
    pub fn driver(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state,
        }
    }

    /// Attach the failing statement. Already-annotated errors are left alone.
    pub fn in_statement(self, statement: &str) -> Self {
        match self {
            Self::Statement { .. } => self,
            other => Self::Statement {
                statement: statement.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Taxonomy bucket of this error, looking through statement context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownDriver { .. } => ErrorKind::UnknownDriver,
            Self::DriverConflict { .. } => ErrorKind::DriverConflict,
            Self::InvalidDataSource { .. } => ErrorKind::InvalidDataSource,
            Self::InvalidOption { .. } => ErrorKind::InvalidOption,
            Self::HandleClosed => ErrorKind::HandleClosed,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::UnsupportedType { .. } => ErrorKind::UnsupportedType,
            Self::ConversionError { .. } => ErrorKind::ConversionError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Driver { .. } => ErrorKind::Driver,
            Self::Statement { source, .. } => source.kind(),
        }
    }

    /// Statement the error was raised for, if known.
    pub fn statement(&self) -> Option<&str> {
        match self {
            Self::Statement { statement, .. } => Some(statement),
            _ => None,
        }
    }

    /// SQLSTATE reported by the database, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Driver { sql_state, .. } => sql_state.as_deref(),
            Self::Statement { source, .. } => source.sql_state(),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::driver(db_err.message(), code)
            }
            sqlx::Error::PoolTimedOut => {
                // acquire_timeout is not visible here; the pool wrapper re-labels it
                DbError::timeout("connection pool acquire", Duration::ZERO)
            }
            sqlx::Error::PoolClosed => DbError::HandleClosed,
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::conversion(index, source.to_string())
            }
            sqlx::Error::Decode(source) => DbError::conversion("<unknown>", source.to_string()),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::unsupported_type("<unknown>", type_name)
            }
            sqlx::Error::Io(io_err) => DbError::driver(format!("I/O error: {}", io_err), None),
            sqlx::Error::Tls(tls_err) => DbError::driver(format!("TLS error: {}", tls_err), None),
            sqlx::Error::Protocol(msg) => DbError::driver(format!("Protocol error: {}", msg), None),
            sqlx::Error::Configuration(msg) => {
                DbError::driver(format!("Configuration error: {}", msg), None)
            }
            other => DbError::driver(other.to_string(), None),
        }
    }
}

/// Result type alias for bridge operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::unknown_driver("no-such-driver");
        assert_eq!(err.to_string(), "Unknown driver: no-such-driver");

        let err = DbError::invalid_argument(2, "NaN is not a valid parameter");
        assert!(err.to_string().contains("position 2"));
    }

    #[test]
    fn test_statement_context_keeps_kind() {
        let err = DbError::timeout("query", Duration::from_millis(50)).in_statement("SELECT 1");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.statement(), Some("SELECT 1"));
        assert!(err.to_string().contains("SELECT 1"));
    }

    #[test]
    fn test_statement_context_not_nested() {
        let err = DbError::driver("boom", None)
            .in_statement("SELECT 1")
            .in_statement("SELECT 2");
        assert_eq!(err.statement(), Some("SELECT 1"));
    }

    #[test]
    fn test_sql_state_passthrough() {
        let err = DbError::driver("duplicate key", Some("23505".to_string())).in_statement("INSERT");
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(err.kind(), ErrorKind::Driver);
    }

    #[test]
    fn test_sqlx_pool_closed_maps_to_handle_closed() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert_eq!(err.kind(), ErrorKind::HandleClosed);
    }

    #[test]
    fn test_sqlx_pool_timeout_maps_to_timeout() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_sqlx_other_maps_to_driver() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::Driver);
    }
}
