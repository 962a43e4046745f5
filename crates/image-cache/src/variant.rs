//! Rounded-corner variants derived from cached originals
//!
//! Requests for the same derived key share one slot, so only the first one
//! renders. A job whose source is not cached yet is parked under the source
//! key and released when the source fetch finishes. Parking happens before
//! the source is checked a second time, so a fetch completing in between
//! cannot slip past unnoticed.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use blob_store::{derived_key_for, key_for, CacheEntry, StoreError};
use tracing::{debug, warn};

use crate::config::VariantSpec;
use crate::engine::{lock, Counters, Engine};
use crate::error::{CacheError, Result};
use crate::request::{VariantRequest, Waiter};
use crate::transport::validate_url;
use crate::types::{VariantReady, VariantResult};

/// Variant work that is scheduled or waiting on its source
#[derive(Default)]
pub(crate) struct VariantRegistry {
    in_flight: HashMap<String, VariantSlot>,
    parked: HashMap<String, Vec<VariantJob>>,
}

struct VariantSlot {
    id: u64,
    waiters: Vec<Waiter<VariantReady>>,
}

#[derive(Debug, Clone)]
struct VariantJob {
    slot_id: u64,
    url: String,
    source_key: String,
    derived_key: String,
    spec: VariantSpec,
    /// The source vanished once already while this job waited
    reparked: bool,
}

impl From<CacheEntry> for VariantReady {
    fn from(entry: CacheEntry) -> Self {
        Self {
            key: entry.key,
            path: entry.path,
            size_bytes: entry.size_bytes,
        }
    }
}

impl Engine {
    pub(crate) async fn request_variant(
        self: &Arc<Self>,
        url: &str,
        spec: VariantSpec,
    ) -> Result<VariantResult> {
        if !self.settings.variants_enabled() {
            return Err(CacheError::VariantsDisabled);
        }
        spec.validate()?;
        validate_url(url)?;

        let derived_key = derived_key_for(url, spec.radius, spec.width, spec.height);

        if let Some(entry) = self.store.lookup(&derived_key).await? {
            self.store.touch(&derived_key).await?;
            Counters::bump(&self.counters.variant_hits);
            debug!(key = %derived_key, "Variant cache hit");
            return Ok(VariantResult::Ready(entry.into()));
        }

        let (waiter, handle) = VariantRequest::new(derived_key.clone());
        let started = {
            let mut registry = lock(&self.variants);
            match registry.in_flight.get_mut(&derived_key) {
                Some(slot) => {
                    slot.waiters.push(waiter);
                    None
                }
                None => {
                    let id = self.next_slot_id();
                    registry.in_flight.insert(
                        derived_key.clone(),
                        VariantSlot {
                            id,
                            waiters: vec![waiter],
                        },
                    );
                    Some(id)
                }
            }
        };

        match started {
            Some(slot_id) => {
                let job = VariantJob {
                    slot_id,
                    url: url.to_string(),
                    source_key: key_for(url),
                    derived_key,
                    spec,
                    reparked: false,
                };
                debug!(
                    key = %job.derived_key,
                    radius = spec.radius,
                    width = spec.width,
                    height = spec.height,
                    "Variant scheduled"
                );

                let engine = self.clone();
                self.runtime.spawn(async move { engine.park(job).await });
            }
            None => {
                Counters::bump(&self.counters.coalesced_requests);
                debug!(key = %derived_key, "Coalesced with in-flight variant");
            }
        }

        Ok(VariantResult::Scheduled(handle))
    }

    /// Wait for the source, fetching it if nothing else is
    async fn park(self: Arc<Self>, job: VariantJob) {
        let source_key = job.source_key.clone();
        let url = job.url.clone();

        lock(&self.variants)
            .parked
            .entry(source_key.clone())
            .or_default()
            .push(job);

        match self.store.lookup(&source_key).await {
            Ok(Some(_)) => self.release_parked(&source_key, Ok(())),
            Ok(None) => {
                debug!(key = %source_key, "Variant waiting on source fetch");
                self.attach_fetch(&url, &source_key, None);
            }
            Err(e) => self.release_parked(&source_key, Err(e.into())),
        }
    }

    /// Hand every job parked on `source_key` the outcome of its source
    pub(crate) fn release_parked(self: &Arc<Self>, source_key: &str, outcome: Result<()>) {
        let jobs = lock(&self.variants)
            .parked
            .remove(source_key)
            .unwrap_or_default();

        for job in jobs {
            match &outcome {
                Ok(()) => {
                    let engine = self.clone();
                    self.runtime.spawn(async move { engine.render_variant(job).await });
                }
                Err(e) => self.finish_variant(&job.derived_key, job.slot_id, Err(e.clone())),
            }
        }
    }

    async fn render_variant(self: Arc<Self>, job: VariantJob) {
        let rendered = self.render(&job).await;
        let outcome = match rendered {
            Ok(Some(ready)) => Ok(ready),
            Ok(None) if !job.reparked => {
                debug!(key = %job.source_key, "Source gone before rendering, waiting again");
                let job = VariantJob {
                    reparked: true,
                    ..job
                };
                self.park(job).await;
                return;
            }
            Ok(None) => Err(CacheError::from(StoreError::from(io::Error::new(
                io::ErrorKind::NotFound,
                "source image is no longer cached",
            )))),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(ready) => debug!(key = %ready.key, size = ready.size_bytes, "Variant ready"),
            Err(CacheError::Cancelled) => debug!(key = %job.derived_key, "Variant abandoned"),
            Err(e) => {
                Counters::bump(&self.counters.failures);
                warn!(url = %job.url, error = %e, "Variant render failed");
            }
        }

        self.finish_variant(&job.derived_key, job.slot_id, outcome);
    }

    /// Render and persist; `None` if the source is not in the store
    async fn render(&self, job: &VariantJob) -> Result<Option<VariantReady>> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| CacheError::Cancelled)?;

        if self.abandon_if_unwanted(&job.derived_key, job.slot_id) {
            return Err(CacheError::Cancelled);
        }

        if let Some(entry) = self.store.lookup(&job.derived_key).await? {
            return Ok(Some(entry.into()));
        }

        let source = match self.memory.get(&job.source_key) {
            Some(loaded) => loaded.image,
            None => match self.store.read(&job.source_key).await? {
                Some((_, data)) => Arc::new(self.decode(data).await?.1),
                None => return Ok(None),
            },
        };

        let codec = self.codec.clone();
        let spec = job.spec;
        let encoded = tokio::task::spawn_blocking(move || {
            codec.render_rounded(&source, spec.radius, spec.width, spec.height)
        })
        .await
        .map_err(|e| CacheError::Decode(format!("render task failed: {}", e)))??;
        Counters::bump(&self.counters.variant_renders);

        let entry = self.store.persist(&job.derived_key, &encoded).await?;
        self.evict_check().await;
        Ok(Some(entry.into()))
    }

    /// Drop the slot if every requester has cancelled; true if dropped
    fn abandon_if_unwanted(&self, derived_key: &str, slot_id: u64) -> bool {
        let mut registry = lock(&self.variants);
        let Some(slot) = registry.in_flight.get_mut(derived_key) else {
            return false;
        };
        if slot.id != slot_id {
            return false;
        }

        slot.waiters.retain(|waiter| !waiter.is_cancelled());
        if slot.waiters.is_empty() {
            registry.in_flight.remove(derived_key);
            return true;
        }
        false
    }

    fn finish_variant(&self, derived_key: &str, slot_id: u64, outcome: Result<VariantReady>) {
        let waiters = {
            let mut registry = lock(&self.variants);
            match registry.in_flight.get(derived_key) {
                Some(slot) if slot.id == slot_id => registry
                    .in_flight
                    .remove(derived_key)
                    .map(|slot| slot.waiters)
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        };

        for waiter in waiters {
            waiter.deliver(outcome.clone());
        }
    }
}
