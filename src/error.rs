//! Error types for polyquery.

use std::error::Error as StdError;

use thiserror::Error;

/// Main error type for query compilation and storage operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Search backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures of the transport itself rather than of the data sent
    /// over it. These are propagated to the caller instead of being folded into
    /// a failed-operations list.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Pool(_) | Error::Tls(_) | Error::Io(_) => true,
            Error::Postgres(e) => match e.as_db_error() {
                Some(db) => db.code().code().starts_with("08"),
                None => {
                    e.is_closed()
                        || e.source().is_some_and(|s| s.is::<std::io::Error>())
                }
            },
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for polyquery operations.
pub type Result<T> = std::result::Result<T, Error>;
