//! Error types for the blob store

use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    /// Reading or writing a blob file failed
    Io(Box<std::io::Error>),
    /// The metadata index rejected a query
    Index(Box<sqlx::Error>),
    /// Applying the index schema failed
    Migrate(String),
    /// The index file failed its integrity check
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "IO error: {}", err),
            StoreError::Index(err) => write!(f, "Metadata index error: {}", err),
            StoreError::Migrate(msg) => write!(f, "Metadata index migration failed: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "Metadata index is corrupt: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err.as_ref()),
            StoreError::Index(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Box::new(err))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Index(Box::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migrate(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
