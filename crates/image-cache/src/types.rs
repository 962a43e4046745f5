//! Core types for the image cache

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::request::VariantRequest;

/// Where a request was satisfied from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Memory,
    Disk,
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Memory => write!(f, "memory"),
            ImageSource::Disk => write!(f, "disk"),
            ImageSource::Network => write!(f, "network"),
        }
    }
}

/// A decoded original image together with its blob on disk
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub image: Arc<DynamicImage>,
    pub source: ImageSource,
}

/// A materialised rounded variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantReady {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Result of asking for a variant: either already on disk, or scheduled
pub enum VariantResult {
    Ready(VariantReady),
    Scheduled(VariantRequest),
}

impl VariantResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, VariantResult::Ready(_))
    }
}

impl std::fmt::Debug for VariantResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariantResult::Ready(ready) => f.debug_tuple("Ready").field(ready).finish(),
            VariantResult::Scheduled(request) => {
                f.debug_tuple("Scheduled").field(&request.key()).finish()
            }
        }
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_size: u64,
    pub max_size: u64,
    pub memory_entries: u64,
    pub memory_weighted_size: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub network_fetches: u64,
    pub coalesced_requests: u64,
    pub variant_hits: u64,
    pub variant_renders: u64,
    pub evictions: u64,
    pub failures: u64,
}
