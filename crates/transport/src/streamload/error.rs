//! Stream-load errors

use thiserror::Error;

/// Errors from schema management over the MySQL protocol
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    /// An existing column has a type the loader cannot write
    #[error("column {table}.{column} has type {actual}, expected {expected}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },

    #[error("invalid metadata server '{0}'")]
    InvalidServer(String),

    #[error("schema management cancelled")]
    Cancelled,
}

impl SchemaError {
    /// Mismatches need an operator; retrying cannot fix them
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }
}

/// Errors from the stream-load transport
#[derive(Debug, Error)]
pub enum StreamLoadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-200 HTTP response
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// HTTP 200 whose load status is not a success
    #[error("load into {table} rejected ({status}): {message}")]
    Rejected {
        table: String,
        status: String,
        message: String,
    },

    #[error("too many redirects loading into {0}")]
    TooManyRedirects(String),

    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("failed to encode load body: {0}")]
    Body(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    Response(#[from] serde_json::Error),

    #[error("invalid table pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("tls error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("address resolution failed: {0}")]
    Pool(#[from] crate::pool::PoolError),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid stream-load property '{0}'")]
    InvalidProperty(String),

    #[error("load cancelled")]
    Cancelled,
}

impl StreamLoadError {
    pub fn pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Whether the endpoint must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Schema(e) if e.is_fatal())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Schema(SchemaError::Cancelled))
    }
}
