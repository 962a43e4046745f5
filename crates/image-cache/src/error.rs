//! Error types for the image cache

use std::fmt;
use std::sync::Arc;

use blob_store::StoreError;

/// Failure outcome of an image or variant request
///
/// A plain cache miss is not an error; lookups return `None` instead.
/// Errors are cloneable because one outcome fans out to every coalesced
/// requester.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Network unreachable, non-success status or timeout
    Transport(String),
    /// Bytes were received but are not a usable image
    Decode(String),
    /// Disk or metadata index failure
    Storage(Arc<StoreError>),
    /// The caller withdrew interest before completion
    Cancelled,
    /// Rounded variants are switched off in the runtime settings
    VariantsDisabled,
    /// Unusable URL or variant parameters
    InvalidRequest(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Transport(msg) => write!(f, "Transport error: {}", msg),
            CacheError::Decode(msg) => write!(f, "Decode error: {}", msg),
            CacheError::Storage(err) => write!(f, "Storage error: {}", err),
            CacheError::Cancelled => write!(f, "Request cancelled"),
            CacheError::VariantsDisabled => write!(f, "Rounded variants are disabled"),
            CacheError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Storage(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Storage(Arc::new(err))
    }
}

impl From<image::ImageError> for CacheError {
    fn from(err: image::ImageError) -> Self {
        CacheError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
