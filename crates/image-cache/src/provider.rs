//! Public entry point of the image cache

use std::path::PathBuf;
use std::sync::Arc;

use blob_store::{key_for, EvictionReport};
use tracing::{info, warn};

use crate::codec::{ImageCodec, RasterCodec};
use crate::config::{CacheConfig, VariantSpec};
use crate::engine::Engine;
use crate::error::Result;
use crate::request::ImageRequest;
use crate::transport::{HttpTransport, Transport};
use crate::types::{CacheStats, VariantResult};

/// Handle to one cache engine
///
/// Cloning is cheap and every clone talks to the same engine. Build one in
/// the process bootstrap and pass it to whatever needs images.
#[derive(Clone)]
pub struct CacheProvider {
    engine: Arc<Engine>,
}

impl CacheProvider {
    /// Open the cache with the HTTP transport and the raster codec
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(
            &config.user_agent,
            config.fetch_timeout(),
        ));
        Self::with_collaborators(config, transport, Arc::new(RasterCodec)).await
    }

    pub async fn with_collaborators(
        config: CacheConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ImageCodec>,
    ) -> Result<Self> {
        let engine = Engine::open(&config, transport, codec).await?;

        info!(
            cache_dir = ?config.cache_dir,
            max_cache_size = config.max_cache_size,
            current_size = engine.store.total_size(),
            workers = config.workers,
            variants_enabled = config.variants_enabled,
            "Image cache opened"
        );

        let provider = Self {
            engine: Arc::new(engine),
        };
        // The budget may have shrunk since the last run
        provider.engine.evict_check().await;
        Ok(provider)
    }

    /// Request an original image
    ///
    /// Memory hits are delivered before this returns; anything else is
    /// loaded in the background.
    pub fn request_image(&self, url: &str) -> Result<ImageRequest> {
        self.engine.request_image(url)
    }

    /// Request a rounded variant, using the runtime default shape when
    /// `spec` is `None`
    pub async fn request_variant(
        &self,
        url: &str,
        spec: Option<VariantSpec>,
    ) -> Result<VariantResult> {
        let spec = spec.unwrap_or_else(|| self.engine.settings.default_variant());
        self.engine.request_variant(url, spec).await
    }

    /// Warm the cache; returns how many fetches were scheduled
    pub fn prefetch<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scheduled = 0;
        for url in urls {
            match self.engine.prefetch(url.as_ref()) {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(e) => warn!(url = %url.as_ref(), error = %e, "Skipping prefetch"),
            }
        }
        scheduled
    }

    /// Remove every cached blob and decoded image
    pub async fn clear_cache(&self) -> Result<()> {
        let removed = self.engine.store.clear().await?;
        self.engine.memory.clear();
        info!(entries = removed.len(), "Image cache cleared");
        Ok(())
    }

    pub fn clear_memory_cache(&self) {
        self.engine.memory.clear();
        info!("Memory cache cleared");
    }

    /// Change the disk budget and evict down to it straight away
    pub async fn set_max_cache_size(&self, bytes: u64) -> Result<EvictionReport> {
        self.engine.settings.set_max_cache_size(bytes);
        info!(max_cache_size = bytes, "Cache budget changed");

        let report = self.engine.store.evict_if_needed(bytes).await?;
        self.engine.forget_evicted(&report);
        Ok(report)
    }

    pub fn current_cache_size(&self) -> u64 {
        self.engine.store.total_size()
    }

    pub fn max_cache_size(&self) -> u64 {
        self.engine.settings.max_cache_size()
    }

    pub fn variants_enabled(&self) -> bool {
        self.engine.settings.variants_enabled()
    }

    pub fn set_variants_enabled(&self, enabled: bool) {
        self.engine.settings.set_variants_enabled(enabled);
        info!(enabled, "Rounded variants toggled");
    }

    pub fn default_variant(&self) -> VariantSpec {
        self.engine.settings.default_variant()
    }

    pub fn set_default_variant(&self, spec: VariantSpec) -> Result<()> {
        spec.validate()?;
        self.engine.settings.set_default_variant(spec);
        info!(
            radius = spec.radius,
            width = spec.width,
            height = spec.height,
            "Default variant changed"
        );
        Ok(())
    }

    /// Path of the cached original for `url`, if it is on disk
    pub async fn cached_path(&self, url: &str) -> Result<Option<PathBuf>> {
        let entry = self.engine.store.lookup(&key_for(url)).await?;
        Ok(entry.map(|e| e.path))
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.engine.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lock;
    use crate::error::CacheError;
    use crate::testing::{eventually, png_bytes, CountingCodec, MockTransport};
    use crate::types::ImageSource;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    const URL: &str = "https://images.example.com/a.png";

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.path().join("cache"),
            ..CacheConfig::default()
        }
    }

    async fn open_with(
        config: CacheConfig,
        transport: &Arc<MockTransport>,
        codec: &Arc<CountingCodec>,
    ) -> CacheProvider {
        CacheProvider::with_collaborators(config, transport.clone(), codec.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_memory_then_disk() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(URL, png_bytes(20, 10));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let first = cache.request_image(URL).unwrap().wait().await.unwrap();
        assert_eq!(first.source, ImageSource::Network);
        assert_eq!(first.image.width(), 20);
        assert_eq!(std::fs::read(&first.path).unwrap(), png_bytes(20, 10));

        let second = cache.request_image(URL).unwrap().wait().await.unwrap();
        assert_eq!(second.source, ImageSource::Memory);
        assert_eq!(second.path, first.path);

        cache.clear_memory_cache();
        let third = cache.request_image(URL).unwrap().wait().await.unwrap();
        assert_eq!(third.source, ImageSource::Disk);

        assert_eq!(transport.calls(), 1);
        assert_eq!(codec.decodes(), 2);
        assert_eq!(cache.current_cache_size(), first.size_bytes);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.network_fetches, 1);
    }

    #[tokio::test]
    async fn test_memory_hit_is_immediate() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(URL, png_bytes(4, 4));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        cache.request_image(URL).unwrap().wait().await.unwrap();

        let mut handle = cache.request_image(URL).unwrap();
        let loaded = handle.try_outcome().unwrap().unwrap();
        assert_eq!(loaded.source, ImageSource::Memory);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::gated();
        transport.respond(URL, png_bytes(8, 8));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let handles: Vec<_> = (0..3).map(|_| cache.request_image(URL).unwrap()).collect();
        transport.release(1);

        for handle in handles {
            let loaded = handle.wait().await.unwrap();
            assert_eq!(loaded.source, ImageSource::Network);
        }

        assert_eq!(transport.calls(), 1);
        assert_eq!(cache.stats().await.unwrap().coalesced_requests, 2);
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_not_persisted() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(URL, b"<html>login required</html>".to_vec());
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let err = cache.request_image(URL).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, CacheError::Decode(_)));
        assert!(cache.cached_path(URL).await.unwrap().is_none());
        assert_eq!(cache.current_cache_size(), 0);
        assert_eq!(cache.stats().await.unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.fail(URL, "connection reset");
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let err = cache.request_image(URL).unwrap().wait().await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(cache.cached_path(URL).await.unwrap().is_none());

        // A failure is not cached; the next request tries again
        transport.respond(URL, png_bytes(2, 2));
        assert!(cache.request_image(URL).unwrap().wait().await.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.hang(URL);
        let codec = CountingCodec::new();
        let config = CacheConfig {
            fetch_timeout_secs: 1,
            ..test_config(&dir)
        };
        let cache = open_with(config, &transport, &codec).await;

        let err = cache.request_image(URL).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, CacheError::Transport(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        assert!(matches!(
            cache.request_image("file:///etc/passwd"),
            Err(CacheError::InvalidRequest(_))
        ));
        assert_eq!(cache.prefetch(["not a url"]), 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_unshared_fetch() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::gated();
        transport.respond(URL, png_bytes(8, 8));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let handle = cache.request_image(URL).unwrap();
        eventually("fetch to start", || async { transport.calls() == 1 }).await;

        handle.cancel();
        assert!(matches!(handle.wait().await, Err(CacheError::Cancelled)));

        let engine = cache.engine.clone();
        eventually("fetch slot to clear", || async {
            lock(&engine.fetches).is_empty()
        })
        .await;

        transport.release(1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(transport.completed(), 0);
        assert!(cache.cached_path(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_request_still_persists_for_prefetch() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::gated();
        transport.respond(URL, png_bytes(8, 8));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        assert_eq!(cache.prefetch([URL]), 1);
        let mut handle = cache.request_image(URL).unwrap();
        handle.cancel();
        transport.release(1);

        eventually("blob to persist", || async {
            cache.cached_path(URL).await.unwrap().is_some()
        })
        .await;

        assert!(handle.try_outcome().is_none());
        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.completed(), 1);
    }

    #[tokio::test]
    async fn test_one_canceller_does_not_abort_shared_fetch() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::gated();
        transport.respond(URL, png_bytes(8, 8));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let leaving = cache.request_image(URL).unwrap();
        let staying = cache.request_image(URL).unwrap();
        drop(leaving);
        transport.release(1);

        assert!(staying.wait().await.is_ok());
        assert_eq!(transport.completed(), 1);
    }

    #[tokio::test]
    async fn test_variant_waits_for_source_and_coalesces() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::gated();
        transport.respond(URL, png_bytes(64, 48));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;
        let spec = VariantSpec::new(6, 32, 32);

        let mut handles = Vec::new();
        for _ in 0..4 {
            match cache.request_variant(URL, Some(spec)).await.unwrap() {
                VariantResult::Scheduled(handle) => handles.push(handle),
                VariantResult::Ready(_) => panic!("variant cannot be ready before its source"),
            }
        }

        eventually("source fetch to start", || async { transport.calls() == 1 }).await;
        transport.release(1);

        let mut keys = Vec::new();
        for handle in handles {
            let ready = handle.wait().await.unwrap();
            assert!(ready.path.exists());
            keys.push(ready.key);
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);

        assert_eq!(codec.renders(), 1);
        assert_eq!(transport.calls(), 1);
        assert!(cache.cached_path(URL).await.unwrap().is_some());

        // Now on disk: the fast path answers without scheduling
        let again = cache.request_variant(URL, Some(spec)).await.unwrap();
        assert!(again.is_ready());
        assert_eq!(codec.renders(), 1);
        assert_eq!(cache.stats().await.unwrap().variant_hits, 1);
    }

    #[tokio::test]
    async fn test_variant_from_cached_source() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(URL, png_bytes(30, 30));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        cache.request_image(URL).unwrap().wait().await.unwrap();

        let VariantResult::Scheduled(handle) = cache.request_variant(URL, None).await.unwrap()
        else {
            panic!("variant should be scheduled");
        };
        let ready = handle.wait().await.unwrap();

        let rendered = image::load_from_memory(&std::fs::read(&ready.path).unwrap()).unwrap();
        let default = cache.default_variant();
        assert_eq!(rendered.width(), default.width);
        assert_eq!(rendered.height(), default.height);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_variant_source_failure_reaches_waiters() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.fail(URL, "gone");
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let VariantResult::Scheduled(handle) = cache.request_variant(URL, None).await.unwrap()
        else {
            panic!("variant should be scheduled");
        };
        assert!(matches!(handle.wait().await, Err(CacheError::Transport(_))));
        assert_eq!(codec.renders(), 0);
    }

    #[tokio::test]
    async fn test_variants_disabled() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        cache.set_variants_enabled(false);
        assert!(matches!(
            cache.request_variant(URL, None).await,
            Err(CacheError::VariantsDisabled)
        ));

        cache.set_variants_enabled(true);
        assert!(cache.set_default_variant(VariantSpec::new(4, 0, 10)).is_err());
        cache.set_default_variant(VariantSpec::new(4, 10, 10)).unwrap();
        assert_eq!(cache.default_variant(), VariantSpec::new(4, 10, 10));
    }

    #[tokio::test]
    async fn test_shrinking_budget_evicts_oldest() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let urls: Vec<String> = (0..3)
            .map(|i| format!("https://images.example.com/{}.png", i))
            .collect();
        let mut sizes = Vec::new();
        for url in &urls {
            transport.respond(url, png_bytes(16, 16));
            sizes.push(cache.request_image(url).unwrap().wait().await.unwrap().size_bytes);
        }

        let budget = sizes[1] + sizes[2];
        let report = cache.set_max_cache_size(budget).await.unwrap();
        assert_eq!(report.evicted, vec![key_for(&urls[0])]);
        assert!(cache.current_cache_size() <= budget);
        assert_eq!(cache.max_cache_size(), budget);

        // The evicted image left the memory cache too
        let reloaded = cache.request_image(&urls[0]).unwrap().wait().await.unwrap();
        assert_eq!(reloaded.source, ImageSource::Network);
        assert!(cache.stats().await.unwrap().evictions >= 1);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(URL, png_bytes(8, 8));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let loaded = cache.request_image(URL).unwrap().wait().await.unwrap();
        cache.clear_cache().await.unwrap();

        assert_eq!(cache.current_cache_size(), 0);
        assert!(!loaded.path.exists());
        assert_eq!(cache.stats().await.unwrap().memory_entries, 0);

        let again = cache.request_image(URL).unwrap().wait().await.unwrap();
        assert_eq!(again.source, ImageSource::Network);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = tempdir().unwrap();
        let codec = CountingCodec::new();

        {
            let transport = MockTransport::new();
            transport.respond(URL, png_bytes(12, 12));
            let cache = open_with(test_config(&dir), &transport, &codec).await;
            cache.request_image(URL).unwrap().wait().await.unwrap();
        }

        let transport = MockTransport::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;
        let loaded = cache.request_image(URL).unwrap().wait().await.unwrap();

        assert_eq!(loaded.source, ImageSource::Disk);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_refetched() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(URL, png_bytes(8, 8));
        let codec = CountingCodec::new();
        let cache = open_with(test_config(&dir), &transport, &codec).await;

        let loaded = cache.request_image(URL).unwrap().wait().await.unwrap();
        std::fs::write(&loaded.path, b"truncated").unwrap();
        cache.clear_memory_cache();

        let again = cache.request_image(URL).unwrap().wait().await.unwrap();
        assert_eq!(again.source, ImageSource::Network);
        assert_eq!(transport.calls(), 2);
    }

    fn image_urls(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://images.example.com/many/{}.png", i))
            .collect()
    }

    /// Every image held in memory still has its blob on disk and in the index
    async fn assert_memory_backed_by_store(cache: &CacheProvider, urls: &[String]) {
        for url in urls {
            if let Some(loaded) = cache.engine.memory.get(&key_for(url)) {
                assert!(loaded.path.is_file(), "{} in memory without a blob", url);
                assert!(
                    cache.cached_path(url).await.unwrap().is_some(),
                    "{} in memory without an index row",
                    url
                );
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_tracks_evictions_under_load() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::gated();
        let codec = CountingCodec::new();
        let config = CacheConfig {
            max_cache_size: png_bytes(16, 16).len() as u64,
            workers: 8,
            ..test_config(&dir)
        };
        let cache = open_with(config, &transport, &codec).await;

        let urls = image_urls(32);
        for url in &urls {
            transport.respond(url, png_bytes(16, 16));
        }

        for round in urls.chunks(8) {
            let handles: Vec<_> = round
                .iter()
                .map(|url| cache.request_image(url).unwrap())
                .collect();
            transport.release(round.len());
            for handle in handles {
                handle.wait().await.unwrap();
            }
        }

        assert_memory_backed_by_store(&cache, &urls).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_store_stays_consistent_while_clearing() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        let codec = CountingCodec::new();
        let config = CacheConfig {
            max_cache_size: 3 * png_bytes(16, 16).len() as u64,
            workers: 8,
            ..test_config(&dir)
        };
        let cache = open_with(config, &transport, &codec).await;

        let urls = image_urls(24);
        for url in &urls {
            transport.respond(url, png_bytes(16, 16));
        }

        let mut tasks = Vec::new();
        for url in urls.clone() {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let _ = cache.request_image(&url).unwrap().wait().await;
            }));
        }
        for _ in 0..3 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..3 {
                    cache.clear_cache().await.unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let store = &cache.engine.store;
        let rows = store.index().all().await.unwrap();
        for row in &rows {
            assert!(row.path.is_file(), "row {} has no blob", row.key);
        }

        let indexed: HashSet<_> = rows.iter().map(|row| row.path.clone()).collect();
        for name in store.disk().list().await.unwrap() {
            assert!(
                indexed.contains(&store.path_for(&name)),
                "blob {} has no row",
                name
            );
        }

        let row_total: u64 = rows.iter().map(|row| row.size_bytes).sum();
        assert_eq!(store.total_size(), row_total);

        assert_memory_backed_by_store(&cache, &urls).await;
    }
}
