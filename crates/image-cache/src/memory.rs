//! In-memory cache of decoded images
//!
//! Bounded by entry count and by an estimate of decoded bytes. Both limits
//! are folded into one moka weight: every entry weighs at least
//! `max_bytes / max_entries`, so staying under `max_bytes` of total weight
//! also keeps the count at or below `max_entries`.

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::debug;

use crate::types::{ImageSource, LoadedImage};

#[derive(Clone)]
struct MemoryEntry {
    image: Arc<DynamicImage>,
    path: PathBuf,
    size_bytes: u64,
    weight: u32,
}

/// Decoded originals keyed by cache key
pub struct MemoryCache {
    cache: Cache<String, MemoryEntry>,
    max_bytes: u64,
    min_weight: u64,
}

impl MemoryCache {
    pub fn new(max_entries: u64, max_bytes: u64) -> Self {
        let max_entries = max_entries.max(1);
        let max_bytes = max_bytes.max(1);
        let min_weight = (max_bytes / max_entries).max(1);

        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &String, entry: &MemoryEntry| entry.weight)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        debug!(max_entries, max_bytes, "Memory cache created");

        Self {
            cache,
            max_bytes,
            min_weight,
        }
    }

    pub fn get(&self, key: &str) -> Option<LoadedImage> {
        self.cache.get(key).map(|entry| LoadedImage {
            key: key.to_string(),
            path: entry.path,
            size_bytes: entry.size_bytes,
            image: entry.image,
            source: ImageSource::Memory,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Cache a decoded image; images larger than the whole budget are skipped
    pub fn put(&self, loaded: &LoadedImage) {
        let estimate = decoded_size(&loaded.image);
        if estimate > self.max_bytes {
            debug!(
                key = %loaded.key,
                estimate,
                max_bytes = self.max_bytes,
                "Decoded image too large for memory cache, skipping"
            );
            return;
        }

        let weight = estimate.max(self.min_weight).min(u32::MAX as u64) as u32;
        self.cache.insert(
            loaded.key.clone(),
            MemoryEntry {
                image: loaded.image.clone(),
                path: loaded.path.clone(),
                size_bytes: loaded.size_bytes,
                weight,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

/// Bytes held by the decoded pixel buffer
fn decoded_size(image: &DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}
