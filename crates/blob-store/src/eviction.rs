//! Least-recently-used eviction against a byte budget

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::disk::DiskStore;
use crate::error::Result;
use crate::index::MetadataIndex;
use crate::types::EvictionReport;

/// Remove the oldest entries until the aggregate size fits `budget`
///
/// A file that cannot be deleted is skipped and the next oldest entry is
/// tried instead. The newest remaining entry is never evicted on its own,
/// so a single blob larger than the budget stays cached.
pub async fn evict_if_needed(
    index: &MetadataIndex,
    disk: &DiskStore,
    budget: u64,
) -> Result<EvictionReport> {
    let mut report = EvictionReport::default();
    let mut skipped: HashSet<String> = HashSet::new();

    while index.total_size() > budget {
        let remaining = index.len().await?;
        if remaining.saturating_sub(skipped.len() as u64) <= 1 {
            break;
        }

        let candidates = index.oldest_entries(skipped.len() + 1).await?;
        let Some(victim) = candidates
            .into_iter()
            .find(|entry| !skipped.contains(&entry.key))
        else {
            break;
        };

        if let Err(e) = disk.remove(&victim.path).await {
            warn!(key = %victim.key, error = %e, "Failed to delete blob during eviction, skipping");
            skipped.insert(victim.key);
            continue;
        }

        if let Some(removed) = index.remove(&victim.key).await? {
            debug!(key = %removed.key, size = removed.size_bytes, "Evicted cache entry");
            report.freed_bytes += removed.size_bytes;
            report.evicted.push(removed.key);
        }
    }

    report.skipped = skipped.len();
    if !report.is_empty() {
        info!(
            evicted = report.evicted.len(),
            freed_bytes = report.freed_bytes,
            skipped = report.skipped,
            total_size = index.total_size(),
            budget,
            "Eviction pass finished"
        );
    }

    Ok(report)
}
