//! Blob files plus their metadata index, kept consistent with each other

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::disk::DiskStore;
use crate::error::Result;
use crate::eviction;
use crate::index::MetadataIndex;
use crate::types::{CacheEntry, EvictionReport, ReconcileReport};

const BLOB_DIR: &str = "blobs";
const INDEX_FILE: &str = "index.sqlite";

/// A blob cache rooted at one directory
///
/// Writers (persist) share the maintenance lock; eviction and clear take it
/// exclusively so neither ever observes the other half done.
pub struct BlobStore {
    index: MetadataIndex,
    disk: DiskStore,
    maintenance: RwLock<()>,
}

impl BlobStore {
    /// Open the store at `root`, repairing any mismatch between the index
    /// and the files on disk
    pub async fn open(root: &Path) -> Result<Self> {
        let disk = DiskStore::new(root.join(BLOB_DIR));
        disk.init().await?;
        let index = MetadataIndex::open(&root.join(INDEX_FILE)).await?;

        let store = Self {
            index,
            disk,
            maintenance: RwLock::new(()),
        };

        let report = store.reconcile().await?;
        info!(
            root = ?root,
            total_size = store.total_size(),
            orphan_files = report.orphan_files,
            orphan_rows = report.orphan_rows,
            temp_files = report.temp_files,
            failed = report.failed,
            "Blob store opened"
        );

        Ok(store)
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    /// The entry for `key`, if both its row and its file exist
    ///
    /// A row whose file has vanished is dropped here.
    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.index.lookup(key).await? else {
            return Ok(None);
        };

        if self.disk.size_of(&entry.path).await?.is_none() {
            self.drop_orphan_row(key).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Read the blob for `key` and mark it as recently used
    pub async fn read(&self, key: &str) -> Result<Option<(CacheEntry, Vec<u8>)>> {
        let Some(mut entry) = self.index.lookup(key).await? else {
            return Ok(None);
        };

        let Some(data) = self.disk.read(&entry.path).await? else {
            self.drop_orphan_row(key).await?;
            return Ok(None);
        };

        let now = self.index.now();
        if self.index.touch(key, now).await? {
            entry.last_accessed_at = now;
        }

        Ok(Some((entry, data)))
    }

    /// Mark `key` as recently used; false if it is not cached
    pub async fn touch(&self, key: &str) -> Result<bool> {
        self.index.touch(key, self.index.now()).await
    }

    /// Drop `key` and its blob file
    ///
    /// The file goes first. If it cannot be deleted the row stays, so the
    /// index never loses track of bytes still on disk.
    pub async fn remove(&self, key: &str) -> Result<Option<CacheEntry>> {
        let _guard = self.maintenance.read().await;

        let Some(entry) = self.index.lookup(key).await? else {
            return Ok(None);
        };
        self.disk.remove(&entry.path).await?;
        Ok(self.index.remove(key).await?.or(Some(entry)))
    }

    /// Run `f` against the entry for `key` while it cannot be evicted or
    /// cleared; `None` if `key` is not indexed
    pub async fn with_live_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&CacheEntry) -> T,
    ) -> Result<Option<T>> {
        let _guard = self.maintenance.read().await;

        Ok(self.index.lookup(key).await?.map(|entry| f(&entry)))
    }

    /// Write `data` under `key` and record it in the index
    ///
    /// The row is only written once the file is complete. If indexing
    /// fails the new file is removed again.
    pub async fn persist(&self, key: &str, data: &[u8]) -> Result<CacheEntry> {
        let _guard = self.maintenance.read().await;

        let path = self.disk.write(key, data).await?;
        let entry = CacheEntry {
            key: key.to_string(),
            path,
            size_bytes: data.len() as u64,
            last_accessed_at: self.index.now(),
        };

        if let Err(e) = self.index.upsert(&entry).await {
            warn!(key = %key, error = %e, "Failed to index blob, removing file");
            let _ = self.disk.remove(&entry.path).await;
            return Err(e);
        }

        Ok(entry)
    }

    /// Evict least-recently-used entries until the store fits `budget`
    pub async fn evict_if_needed(&self, budget: u64) -> Result<EvictionReport> {
        if self.index.total_size() <= budget {
            return Ok(EvictionReport::default());
        }
        let _guard = self.maintenance.write().await;
        eviction::evict_if_needed(&self.index, &self.disk, budget).await
    }

    /// Remove every entry and blob file; returns the removed keys
    pub async fn clear(&self) -> Result<Vec<String>> {
        let _guard = self.maintenance.write().await;

        let removed = self.index.clear().await?;
        for entry in &removed {
            if let Err(e) = self.disk.remove(&entry.path).await {
                warn!(key = %entry.key, error = %e, "Failed to delete blob while clearing");
            }
        }

        for name in self.disk.list().await? {
            if let Err(e) = self.disk.remove(&self.disk.path_for(&name)).await {
                warn!(file = %name, error = %e, "Failed to delete stray file while clearing");
            }
        }

        info!(entries = removed.len(), "Blob store cleared");
        Ok(removed.into_iter().map(|e| e.key).collect())
    }

    pub fn total_size(&self) -> u64 {
        self.index.total_size()
    }

    pub async fn entry_count(&self) -> Result<u64> {
        self.index.len().await
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.disk.path_for(key)
    }

    /// Bring the index and the blob directory back into agreement
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.maintenance.write().await;
        let mut report = ReconcileReport::default();

        let entries = self.index.all().await?;
        let mut indexed: HashSet<PathBuf> = HashSet::with_capacity(entries.len());

        for entry in entries {
            match self.disk.size_of(&entry.path).await {
                Ok(Some(_)) => {
                    indexed.insert(entry.path);
                }
                Ok(None) => {
                    self.index.remove(&entry.key).await?;
                    report.orphan_rows += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "Cannot stat blob, keeping its row");
                    indexed.insert(entry.path);
                    report.failed += 1;
                }
            }
        }

        for name in self.disk.list().await? {
            let path = self.disk.path_for(&name);
            let temp = DiskStore::is_temp_name(&name);
            if !temp && indexed.contains(&path) {
                continue;
            }
            match self.disk.remove(&path).await {
                Ok(_) if temp => report.temp_files += 1,
                Ok(_) => report.orphan_files += 1,
                Err(e) => {
                    warn!(file = %name, error = %e, "Failed to delete stray blob file, leaving it");
                    report.failed += 1;
                }
            }
        }

        self.index.recompute_total_size().await?;
        Ok(report)
    }

    /// Drop the row for `key` if its file is still missing
    ///
    /// A concurrent persist may have rewritten both since the caller looked.
    async fn drop_orphan_row(&self, key: &str) -> Result<()> {
        let _guard = self.maintenance.read().await;

        let Some(entry) = self.index.lookup(key).await? else {
            return Ok(());
        };
        if self.disk.size_of(&entry.path).await?.is_some() {
            return Ok(());
        }
        if self.index.remove(key).await?.is_some() {
            debug!(key = %key, "Dropped index row with missing blob");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_persist_and_read() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let entry = store.persist("k1", b"Hello, world!").await.unwrap();
        assert_eq!(entry.size_bytes, 13);
        assert_eq!(store.total_size(), 13);

        let (found, data) = store.read("k1").await.unwrap().unwrap();
        assert_eq!(data, b"Hello, world!");
        assert!(found.last_accessed_at > entry.last_accessed_at);
    }

    #[tokio::test]
    async fn test_miss() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        assert!(store.read("nonexistent").await.unwrap().is_none());
        assert!(store.lookup("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_drops_row() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let entry = store.persist("k1", b"data").await.unwrap();
        std::fs::remove_file(&entry.path).unwrap();

        assert!(store.read("k1").await.unwrap().is_none());
        assert!(store.index().lookup("k1").await.unwrap().is_none());
        assert_eq!(store.total_size(), 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let entry = store.persist("k1", b"data").await.unwrap();
        let removed = store.remove("k1").await.unwrap().unwrap();
        assert_eq!(removed.path, entry.path);
        assert!(!entry.path.exists());
        assert_eq!(store.total_size(), 0);
        assert!(store.remove("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        store.persist("k1", b"one").await.unwrap();
        store.persist("k2", b"two").await.unwrap();

        let removed = store.clear().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.lookup("k1").await.unwrap().is_none());
        assert_eq!(store.total_size(), 0);
        assert!(store.disk().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_repairs_orphans() {
        let dir = tempdir().unwrap();

        {
            let store = BlobStore::open(dir.path()).await.unwrap();
            store.persist("kept", b"kept").await.unwrap();
            let gone = store.persist("gone", b"gone").await.unwrap();
            std::fs::remove_file(&gone.path).unwrap();
            store.index().close().await;
        }

        // Stray blob and an interrupted write left behind
        std::fs::write(dir.path().join("blobs").join("stray"), b"stray").unwrap();
        std::fs::write(dir.path().join("blobs").join("kept.tmp.1.0"), b"partial").unwrap();

        let store = BlobStore::open(dir.path()).await.unwrap();
        assert!(store.lookup("kept").await.unwrap().is_some());
        assert!(store.lookup("gone").await.unwrap().is_none());
        assert_eq!(store.total_size(), 4);
        assert_eq!(store.disk().list().await.unwrap(), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_cold() {
        let dir = tempdir().unwrap();

        {
            let store = BlobStore::open(dir.path()).await.unwrap();
            store.persist("k1", b"data").await.unwrap();
            store.index().close().await;
        }

        std::fs::write(dir.path().join(INDEX_FILE), b"garbage garbage garbage").unwrap();
        let _ = std::fs::remove_file(dir.path().join("index.sqlite-wal"));
        let _ = std::fs::remove_file(dir.path().join("index.sqlite-shm"));

        let store = BlobStore::open(dir.path()).await.unwrap();
        assert!(store.lookup("k1").await.unwrap().is_none());
        assert_eq!(store.total_size(), 0);
        // The blob no longer has a row, so it was removed as an orphan
        assert!(store.disk().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evict_if_needed_through_store() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        store.persist("a", b"0123456789").await.unwrap();
        store.persist("b", b"abcdefghij").await.unwrap();
        store.persist("c", b"ABCDEFGHIJ").await.unwrap();

        let report = store.evict_if_needed(20).await.unwrap();
        assert_eq!(report.evicted, vec!["a".to_string()]);
        assert!(store.total_size() <= 20);
    }

    #[tokio::test]
    async fn test_remove_keeps_row_when_file_cannot_be_deleted() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let entry = store.persist("k1", b"data").await.unwrap();
        std::fs::remove_file(&entry.path).unwrap();
        std::fs::create_dir(&entry.path).unwrap();

        assert!(store.remove("k1").await.is_err());
        assert!(store.index().lookup("k1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_skips_undeletable_entries() {
        let dir = tempdir().unwrap();
        let blobs = dir.path().join("blobs");
        std::fs::create_dir_all(blobs.join("foreign")).unwrap();
        std::fs::write(blobs.join("stray"), b"stray").unwrap();

        let store = BlobStore::open(dir.path()).await.unwrap();
        store.persist("k1", b"data").await.unwrap();

        let report = store.reconcile().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.orphan_files, 0);
        assert!(store.lookup("k1").await.unwrap().is_some());
        assert!(!blobs.join("stray").exists());
        assert!(blobs.join("foreign").is_dir());
    }

    #[tokio::test]
    async fn test_orphan_repair_spares_rewritten_entry() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let entry = store.persist("k1", b"old").await.unwrap();
        std::fs::remove_file(&entry.path).unwrap();
        // Rewritten after a reader saw the file missing
        store.persist("k1", b"new").await.unwrap();

        store.drop_orphan_row("k1").await.unwrap();
        let (_, data) = store.read("k1").await.unwrap().unwrap();
        assert_eq!(data, b"new");
        assert_eq!(store.total_size(), 3);
    }

    #[tokio::test]
    async fn test_with_live_entry() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        store.persist("k1", b"data").await.unwrap();
        let size = store.with_live_entry("k1", |e| e.size_bytes).await.unwrap();
        assert_eq!(size, Some(4));

        store.clear().await.unwrap();
        let mut called = false;
        let missing = store.with_live_entry("k1", |_| called = true).await.unwrap();
        assert!(missing.is_none());
        assert!(!called);
    }
}
