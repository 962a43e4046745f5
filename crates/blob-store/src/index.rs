//! Durable metadata index backed by SQLite
//!
//! The pool holds a single connection, so every statement and transaction
//! runs exclusively. The aggregate size is kept in memory and adjusted while
//! a mutating transaction still owns that connection, which keeps it equal
//! to the sum of `size_bytes` over all rows.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::types::CacheEntry;

#[derive(Debug, FromRow)]
struct EntryRow {
    key: String,
    path: String,
    size_bytes: i64,
    last_accessed_at: i64,
}

impl From<EntryRow> for CacheEntry {
    fn from(row: EntryRow) -> Self {
        CacheEntry {
            key: row.key,
            path: row.path.into(),
            size_bytes: row.size_bytes.max(0) as u64,
            last_accessed_at: from_micros(row.last_accessed_at),
        }
    }
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Hands out strictly increasing access timestamps
///
/// Two accesses within the same microsecond, or a wall clock that stepped
/// backwards, still get distinct ordered values.
struct RecencyClock {
    last_micros: AtomicI64,
}

impl RecencyClock {
    fn starting_after(micros: i64) -> Self {
        Self {
            last_micros: AtomicI64::new(micros),
        }
    }

    fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        from_micros(now.max(previous + 1))
    }
}

/// Table of cache entries: key, blob path, size and last access time
pub struct MetadataIndex {
    pool: SqlitePool,
    total_size: AtomicU64,
    clock: RecencyClock,
}

impl MetadataIndex {
    /// Open the index at `path`, rebuilding it empty if it is unreadable
    pub async fn open(path: &Path) -> Result<Self> {
        match Self::connect(path).await {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Metadata index unreadable, rebuilding empty"
                );
                remove_database_files(path).await?;
                Self::connect(path).await
            }
        }
    }

    async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await?;
        if check != "ok" {
            pool.close().await;
            return Err(StoreError::Corrupt(check));
        }

        sqlx::migrate!().run(&pool).await?;

        let (total, newest): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COALESCE(SUM(size_bytes), 0), MAX(last_accessed_at) FROM cache_entries",
        )
        .fetch_one(&pool)
        .await?;

        info!(path = %path.display(), total_size = total, "Metadata index opened");

        Ok(Self {
            pool,
            total_size: AtomicU64::new(total.max(0) as u64),
            clock: RecencyClock::starting_after(newest.unwrap_or(0)),
        })
    }

    /// Next access timestamp; later calls always return later values
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.next()
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT key, path, size_bytes, last_accessed_at FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CacheEntry::from))
    }

    /// Create or replace the row for `entry.key`
    pub async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<i64> =
            sqlx::query_scalar("SELECT size_bytes FROM cache_entries WHERE key = ?")
                .bind(&entry.key)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, path, size_bytes, last_accessed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                path = excluded.path,
                size_bytes = excluded.size_bytes,
                last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(&entry.key)
        .bind(entry.path.to_string_lossy().into_owned())
        .bind(entry.size_bytes as i64)
        .bind(entry.last_accessed_at.timestamp_micros())
        .execute(&mut *tx)
        .await?;

        let previous = previous.unwrap_or(0).max(0) as u64;
        self.adjust_total(previous, entry.size_bytes);
        if let Err(e) = tx.commit().await {
            self.adjust_total(entry.size_bytes, previous);
            return Err(e.into());
        }

        debug!(key = %entry.key, size = entry.size_bytes, "Indexed entry");
        Ok(())
    }

    /// Update `last_accessed_at` only; returns false if the key is absent
    pub async fn touch(&self, key: &str, timestamp: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE cache_entries SET last_accessed_at = ? WHERE key = ?")
            .bind(timestamp.timestamp_micros())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the row for `key`, returning it if it existed
    pub async fn remove(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, EntryRow>(
            "DELETE FROM cache_entries WHERE key = ? RETURNING key, path, size_bytes, last_accessed_at",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = row.map(CacheEntry::from) else {
            return Ok(None);
        };

        self.adjust_total(entry.size_bytes, 0);
        if let Err(e) = tx.commit().await {
            self.adjust_total(0, entry.size_bytes);
            return Err(e.into());
        }

        Ok(Some(entry))
    }

    /// Up to `n` entries, least recently accessed first, ties by key
    pub async fn oldest_entries(&self, n: usize) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT key, path, size_bytes, last_accessed_at
            FROM cache_entries
            ORDER BY last_accessed_at ASC, key ASC
            LIMIT ?
            "#,
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CacheEntry::from).collect())
    }

    pub async fn all(&self) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT key, path, size_bytes, last_accessed_at FROM cache_entries ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CacheEntry::from).collect())
    }

    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Delete every row, returning what was removed
    pub async fn clear(&self) -> Result<Vec<CacheEntry>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, EntryRow>(
            "DELETE FROM cache_entries RETURNING key, path, size_bytes, last_accessed_at",
        )
        .fetch_all(&mut *tx)
        .await?;

        let previous = self.total_size.swap(0, Ordering::AcqRel);
        if let Err(e) = tx.commit().await {
            self.total_size.store(previous, Ordering::Release);
            return Err(e.into());
        }

        Ok(rows.into_iter().map(CacheEntry::from).collect())
    }

    /// Sum of `size_bytes` over all entries
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    /// Recompute the aggregate size from the table
    pub async fn recompute_total_size(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries")
            .fetch_one(&mut *tx)
            .await?;
        let total = total.max(0) as u64;
        self.total_size.store(total, Ordering::Release);
        tx.commit().await?;
        Ok(total)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn adjust_total(&self, removed: u64, added: u64) {
        let _ = self
            .total_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(removed).saturating_add(added))
            });
    }
}

async fn remove_database_files(path: &Path) -> Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(name.into());
    }

    for candidate in candidates {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
