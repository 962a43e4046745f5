//! Original image requests: memory, then disk, then network
//!
//! Concurrent requests for the same URL share one slot and one background
//! task. The slot's abort token stops the network transfer, and it is only
//! fired once every attached requester has cancelled and no prefetch or
//! parked variant depends on the result.

use std::sync::{Arc, Weak};

use blob_store::key_for;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{lock, Counters, Engine};
use crate::error::{CacheError, Result};
use crate::request::{ImageRequest, Waiter};
use crate::transport::validate_url;
use crate::types::{ImageSource, LoadedImage};

/// One in-flight original fetch
pub(crate) struct FetchSlot {
    id: u64,
    abort: CancellationToken,
    waiters: Vec<Waiter<LoadedImage>>,
    /// Someone needs the blob persisted even if every waiter leaves
    detached: bool,
}

impl Engine {
    pub(crate) fn request_image(self: &Arc<Self>, url: &str) -> Result<ImageRequest> {
        validate_url(url)?;
        let key = key_for(url);

        if let Some(loaded) = self.memory.get(&key) {
            debug!(key = %key, "Memory cache hit");
            Counters::bump(&self.counters.memory_hits);
            let (waiter, handle) = ImageRequest::new(key);
            waiter.deliver(Ok(loaded));
            return Ok(handle);
        }

        let (waiter, handle) = ImageRequest::new(key.clone());
        let engine: Weak<Engine> = Arc::downgrade(self);
        let hook_key = key.clone();
        let handle = handle.with_cancel_hook(move || {
            if let Some(engine) = engine.upgrade() {
                engine.on_fetch_cancelled(&hook_key);
            }
        });

        self.attach_fetch(url, &key, Some(waiter));
        Ok(handle)
    }

    /// Schedule a fetch nobody waits on; false if the image is already in memory
    pub(crate) fn prefetch(self: &Arc<Self>, url: &str) -> Result<bool> {
        validate_url(url)?;
        let key = key_for(url);

        if self.memory.contains(&key) {
            return Ok(false);
        }

        self.attach_fetch(url, &key, None);
        Ok(true)
    }

    /// Join the fetch for `key` if one is running, otherwise start it
    ///
    /// A `None` waiter marks the fetch as detached.
    pub(crate) fn attach_fetch(
        self: &Arc<Self>,
        url: &str,
        key: &str,
        waiter: Option<Waiter<LoadedImage>>,
    ) {
        let mut fetches = lock(&self.fetches);

        if let Some(slot) = fetches.get_mut(key) {
            if !slot.abort.is_cancelled() {
                match waiter {
                    Some(waiter) => slot.waiters.push(waiter),
                    None => slot.detached = true,
                }
                Counters::bump(&self.counters.coalesced_requests);
                debug!(key = %key, "Coalesced with in-flight fetch");
                return;
            }
        }

        let id = self.next_slot_id();
        let abort = CancellationToken::new();
        let detached = waiter.is_none();
        fetches.insert(
            key.to_string(),
            FetchSlot {
                id,
                abort: abort.clone(),
                waiters: waiter.into_iter().collect(),
                detached,
            },
        );
        drop(fetches);

        let engine = self.clone();
        let url = url.to_string();
        let key = key.to_string();
        self.runtime.spawn(async move {
            engine.run_fetch(url, key, id, abort).await;
        });
    }

    async fn run_fetch(self: Arc<Self>, url: String, key: String, id: u64, abort: CancellationToken) {
        let outcome = self.load_original(&url, &key, &abort).await;

        match &outcome {
            Ok(loaded) => debug!(key = %key, source = %loaded.source, "Image ready"),
            Err(CacheError::Cancelled) => debug!(key = %key, "Fetch abandoned"),
            Err(e) => {
                Counters::bump(&self.counters.failures);
                warn!(url = %url, error = %e, "Image request failed");
            }
        }

        self.finish_fetch(&key, id, outcome);
    }

    async fn load_original(
        &self,
        url: &str,
        key: &str,
        abort: &CancellationToken,
    ) -> Result<LoadedImage> {
        let _permit = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(CacheError::Cancelled),
            permit = self.workers.acquire() => permit.map_err(|_| CacheError::Cancelled)?,
        };

        if let Some(loaded) = self.load_from_disk(key).await? {
            return Ok(loaded);
        }

        if abort.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        Counters::bump(&self.counters.network_fetches);
        debug!(key = %key, url = %url, "Cache miss, fetching");

        let data = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(CacheError::Cancelled),
            fetched = tokio::time::timeout(self.fetch_timeout, self.transport.fetch(url)) => {
                match fetched {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(CacheError::Transport(format!(
                            "timed out after {}s",
                            self.fetch_timeout.as_secs()
                        )))
                    }
                }
            }
        };

        let (data, image) = self.decode(data).await?;

        // From here on the blob is kept even if every requester has left
        let entry = self.store.persist(key, &data).await?;

        let loaded = LoadedImage {
            key: key.to_string(),
            path: entry.path,
            size_bytes: entry.size_bytes,
            image: Arc::new(image),
            source: ImageSource::Network,
        };
        let remembered = self.remember(&loaded).await;
        self.evict_check().await;
        remembered?;
        Ok(loaded)
    }

    /// Serve from the blob store, dropping blobs that no longer decode
    async fn load_from_disk(&self, key: &str) -> Result<Option<LoadedImage>> {
        let Some((entry, data)) = self.store.read(key).await? else {
            return Ok(None);
        };

        match self.decode(data).await {
            Ok((_, image)) => {
                Counters::bump(&self.counters.disk_hits);
                debug!(key = %key, size = entry.size_bytes, "Disk cache hit");

                let loaded = LoadedImage {
                    key: key.to_string(),
                    path: entry.path,
                    size_bytes: entry.size_bytes,
                    image: Arc::new(image),
                    source: ImageSource::Disk,
                };
                self.remember(&loaded).await?;
                Ok(Some(loaded))
            }
            Err(CacheError::Decode(reason)) => {
                warn!(key = %key, reason = %reason, "Cached blob no longer decodes, removing");
                if let Err(e) = self.store.remove(key).await {
                    warn!(key = %key, error = %e, "Failed to remove undecodable blob");
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Keep `loaded` in memory only while its blob is still indexed
    ///
    /// Eviction and clear wait for the put, so their memory invalidation
    /// always lands after it.
    async fn remember(&self, loaded: &LoadedImage) -> Result<()> {
        let kept = self
            .store
            .with_live_entry(&loaded.key, |_| self.memory.put(loaded))
            .await?;
        if kept.is_none() {
            debug!(key = %loaded.key, "Blob evicted before it reached memory");
        }
        Ok(())
    }

    fn finish_fetch(self: &Arc<Self>, key: &str, id: u64, outcome: Result<LoadedImage>) {
        let waiters = {
            let mut fetches = lock(&self.fetches);
            match fetches.get(key) {
                Some(slot) if slot.id == id => fetches
                    .remove(key)
                    .map(|slot| slot.waiters)
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        };

        for waiter in waiters {
            waiter.deliver(outcome.clone());
        }

        if matches!(outcome, Err(CacheError::Cancelled)) {
            return;
        }
        self.release_parked(key, outcome.map(|_| ()));
    }

    /// Abort the transfer once nobody is left to receive it
    fn on_fetch_cancelled(&self, key: &str) {
        let mut fetches = lock(&self.fetches);
        let Some(slot) = fetches.get_mut(key) else {
            return;
        };

        slot.waiters.retain(|waiter| !waiter.is_cancelled());
        if slot.waiters.is_empty() && !slot.detached {
            debug!(key = %key, "All requesters cancelled, aborting fetch");
            slot.abort.cancel();
        }
    }
}
