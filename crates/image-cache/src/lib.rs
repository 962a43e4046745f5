//! Asynchronous image cache
//!
//! Originals are fetched over the network, validated by decoding, and kept
//! on disk in a [`blob_store::BlobStore`] under a size budget with
//! least-recently-used eviction. Decoded images are additionally held in a
//! small memory cache. Rounded-corner variants are rendered from cached
//! originals and stored under their own keys.
//!
//! Everything goes through a [`CacheProvider`]:
//!
//! ```no_run
//! # async fn demo() -> image_cache::Result<()> {
//! use image_cache::{CacheConfig, CacheProvider, VariantResult};
//!
//! let cache = CacheProvider::open(CacheConfig::from_env()).await?;
//!
//! let original = cache.request_image("https://example.com/a.jpg")?.wait().await?;
//! println!("{} from {}", original.path.display(), original.source);
//!
//! match cache.request_variant("https://example.com/a.jpg", None).await? {
//!     VariantResult::Ready(ready) => println!("{}", ready.path.display()),
//!     VariantResult::Scheduled(request) => {
//!         let ready = request.wait().await?;
//!         println!("{}", ready.path.display());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod engine;
mod error;
mod fetch;
mod memory;
mod provider;
mod request;
mod transport;
mod types;
mod variant;

#[cfg(test)]
mod testing;

pub use codec::{round_corners, ImageCodec, RasterCodec};
pub use config::{CacheConfig, VariantSpec};
pub use error::{CacheError, Result};
pub use memory::MemoryCache;
pub use provider::CacheProvider;
pub use request::{ImageRequest, RequestHandle, VariantRequest};
pub use transport::{validate_url, HttpTransport, Transport};
pub use types::{CacheStats, ImageSource, LoadedImage, VariantReady, VariantResult};

pub use blob_store::EvictionReport;
