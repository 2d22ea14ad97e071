//! Error types for marketsync.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for marketsync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// HTTP transport error against a remote marketplace API
    #[error("HTTP error calling '{path}': {message}")]
    Http {
        /// Request path
        path: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Authentication/authorization rejected by the remote API.
    ///
    /// Fatal for the current entity-type run; sibling entity runs continue.
    #[error("Authentication failed for '{path}' (status {status})")]
    Auth {
        /// Request path
        path: String,
        /// HTTP status returned
        status: u16,
    },

    /// Warehouse connection error
    #[error("Warehouse connection error: {message}")]
    WarehouseConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Warehouse query error
    #[error("Warehouse query error on table '{table}': {message}")]
    WarehouseQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Entity graph / shape declaration error
    #[error("Schema error: {message}")]
    Schema {
        /// Error message
        message: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Normalization error for one document
    #[error("Normalization error for table '{table}': {message}")]
    Normalize {
        /// Target table
        table: String,
        /// Error message
        message: String,
    },

    /// Reconciliation error for one record
    #[error("Reconcile error for '{table}' key '{natural_key}': {message}")]
    Reconcile {
        /// Target table
        table: String,
        /// Natural key of the record
        natural_key: String,
        /// Error message
        message: String,
    },

    /// Retry exhausted
    #[error("Operation failed after {attempts} attempts: {message}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error message
        message: String,
        /// Last error encountered
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an HTTP transport error.
    pub fn http(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an HTTP transport error with reqwest source.
    pub fn http_with_source(
        path: impl Into<String>,
        message: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::Http {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a warehouse connection error.
    pub fn warehouse_connection(message: impl Into<String>) -> Self {
        Self::WarehouseConnection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a warehouse connection error with tokio_postgres::Error.
    pub fn warehouse_connection_pg(
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::WarehouseConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a warehouse query error.
    pub fn warehouse_query(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WarehouseQuery {
            table: table.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a warehouse query error with tokio_postgres::Error.
    pub fn warehouse_query_pg(
        table: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::WarehouseQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a normalization error.
    pub fn normalize(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Normalize {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a reconciliation error.
    pub fn reconcile(
        table: impl Into<String>,
        natural_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Reconcile {
            table: table.into(),
            natural_key: natural_key.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http { .. } | Error::WarehouseConnection { .. } | Error::Io(_)
        )
    }

    /// Check if this error aborts the current entity-type run.
    ///
    /// Everything else is recovered at record or page scope.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth { .. } | Error::WarehouseConnection { .. } | Error::Config { .. }
        )
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Http { .. } => "HTTP_ERROR",
            Error::Auth { .. } => "AUTH_ERROR",
            Error::WarehouseConnection { .. } => "WH_CONNECTION_ERROR",
            Error::WarehouseQuery { .. } => "WH_QUERY_ERROR",
            Error::Schema { .. } => "SCHEMA_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Normalize { .. } => "NORMALIZE_ERROR",
            Error::Reconcile { .. } => "RECONCILE_ERROR",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::Cancelled => "CANCELLED",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config("test").code(), "CONFIG_ERROR");
        assert_eq!(Error::validation("test").code(), "VALIDATION_ERROR");
        assert_eq!(Error::schema("test").code(), "SCHEMA_ERROR");
        assert_eq!(Error::normalize("offers", "bad").code(), "NORMALIZE_ERROR");
    }

    #[test]
    fn test_fatal_classification() {
        let auth = Error::Auth {
            path: "/v1/offers".into(),
            status: 401,
        };
        assert!(auth.is_fatal());
        assert!(Error::warehouse_connection("down").is_fatal());
        assert!(!Error::validation("shape mismatch").is_fatal());
        assert!(!Error::http("/v1/offers", "timeout").is_fatal());
        assert!(!Error::reconcile("offers", "m1-o1", "missing parent").is_fatal());
    }

    #[test]
    fn test_retryable() {
        assert!(!Error::config("test").is_retryable());
        assert!(Error::http("/x", "reset").is_retryable());
        assert!(Error::warehouse_connection("down").is_retryable());
    }
}
