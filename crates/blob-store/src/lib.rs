//! Disk blob store with a durable metadata index and LRU eviction
//!
//! Blobs live as individual files under a cache root, named by their cache
//! key. A SQLite index records the path, size and last access time of every
//! blob so existence checks and least-recently-used eviction never need to
//! scan the directory.

mod disk;
mod error;
mod eviction;
mod index;
pub mod keyer;
mod store;
mod types;

pub use disk::DiskStore;
pub use error::{Result, StoreError};
pub use eviction::evict_if_needed;
pub use index::MetadataIndex;
pub use keyer::{derived_key_for, key_for};
pub use store::BlobStore;
pub use types::{CacheEntry, EvictionReport, ReconcileReport};
