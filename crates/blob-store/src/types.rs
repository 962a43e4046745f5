//! Blob store types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for a cached blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_accessed_at: DateTime<Utc>,
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Keys removed, oldest first
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    /// Entries whose file could not be deleted and were left in place
    pub skipped: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.skipped == 0
    }
}

/// Repairs made while reconciling the index with the blob directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub orphan_files: usize,
    pub orphan_rows: usize,
    pub temp_files: usize,
    /// Files or rows that could not be repaired and were left in place
    pub failed: usize,
}
