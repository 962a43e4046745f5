//! Shared state behind a [`CacheProvider`](crate::CacheProvider)
//!
//! The engine owns the blob store, the memory cache and the two
//! collaborators, plus the registries of in-flight work. Each registry sits
//! behind its own mutex which is never held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use blob_store::{BlobStore, EvictionReport};
use image::DynamicImage;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::codec::ImageCodec;
use crate::config::{CacheConfig, RuntimeSettings};
use crate::error::{CacheError, Result};
use crate::fetch::FetchSlot;
use crate::memory::MemoryCache;
use crate::transport::Transport;
use crate::types::CacheStats;
use crate::variant::VariantRegistry;

/// Running counters reported through [`CacheStats`]
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) memory_hits: AtomicU64,
    pub(crate) disk_hits: AtomicU64,
    pub(crate) network_fetches: AtomicU64,
    pub(crate) coalesced_requests: AtomicU64,
    pub(crate) variant_hits: AtomicU64,
    pub(crate) variant_renders: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) failures: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct Engine {
    pub(crate) store: BlobStore,
    pub(crate) memory: MemoryCache,
    pub(crate) codec: Arc<dyn ImageCodec>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) settings: RuntimeSettings,
    pub(crate) counters: Counters,
    pub(crate) workers: Semaphore,
    pub(crate) fetch_timeout: Duration,
    pub(crate) runtime: Handle,
    pub(crate) fetches: Mutex<HashMap<String, FetchSlot>>,
    pub(crate) variants: Mutex<VariantRegistry>,
    next_slot: AtomicU64,
}

impl Engine {
    /// Open the store and assemble the engine; must run inside a tokio runtime
    pub(crate) async fn open(
        config: &CacheConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ImageCodec>,
    ) -> Result<Self> {
        let store = BlobStore::open(&config.cache_dir).await?;

        Ok(Self {
            store,
            memory: MemoryCache::new(config.memory_max_entries, config.memory_max_bytes),
            codec,
            transport,
            settings: RuntimeSettings::new(config),
            counters: Counters::default(),
            workers: Semaphore::new(config.workers.max(1)),
            fetch_timeout: config.fetch_timeout(),
            runtime: Handle::current(),
            fetches: Mutex::new(HashMap::new()),
            variants: Mutex::new(VariantRegistry::default()),
            next_slot: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_slot_id(&self) -> u64 {
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }

    /// Decode on the blocking pool, handing the bytes back alongside the image
    pub(crate) async fn decode(&self, data: Vec<u8>) -> Result<(Vec<u8>, DynamicImage)> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || codec.decode(&data).map(|image| (data, image)))
            .await
            .map_err(|e| CacheError::Decode(format!("decode task failed: {}", e)))?
    }

    /// Bring the store back under the current budget
    pub(crate) async fn evict_check(&self) {
        match self
            .store
            .evict_if_needed(self.settings.max_cache_size())
            .await
        {
            Ok(report) => self.forget_evicted(&report),
            Err(e) => warn!(error = %e, "Eviction check failed"),
        }
    }

    /// Keep the memory cache from pointing at blobs that are gone
    pub(crate) fn forget_evicted(&self, report: &EvictionReport) {
        if report.is_empty() {
            return;
        }
        for key in &report.evicted {
            self.memory.invalidate(key);
        }
        self.counters
            .evictions
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        debug!(
            evicted = report.evicted.len(),
            freed_bytes = report.freed_bytes,
            "Invalidated evicted entries in memory cache"
        );
    }

    pub(crate) async fn stats(&self) -> Result<CacheStats> {
        let counters = &self.counters;
        Ok(CacheStats {
            entries: self.store.entry_count().await?,
            total_size: self.store.total_size(),
            max_size: self.settings.max_cache_size(),
            memory_entries: self.memory.entry_count(),
            memory_weighted_size: self.memory.weighted_size(),
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: counters.disk_hits.load(Ordering::Relaxed),
            network_fetches: counters.network_fetches.load(Ordering::Relaxed),
            coalesced_requests: counters.coalesced_requests.load(Ordering::Relaxed),
            variant_hits: counters.variant_hits.load(Ordering::Relaxed),
            variant_renders: counters.variant_renders.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        })
    }
}

/// Lock a registry, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
