//! Cache configuration and the settings that can change at runtime

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

const DEFAULT_MAX_CACHE_SIZE: u64 = 500 * 1024 * 1024; // 500 MB
const DEFAULT_MEMORY_MAX_ENTRIES: u64 = 48;
const DEFAULT_MEMORY_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Shape of a rounded-corner variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantSpec {
    pub radius: u32,
    pub width: u32,
    pub height: u32,
}

impl VariantSpec {
    pub fn new(radius: u32, width: u32, height: u32) -> Self {
        Self {
            radius,
            width,
            height,
        }
    }

    /// Replace the fields that were given, keep the rest
    pub fn with_overrides(
        self,
        radius: Option<u32>,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Self {
        Self {
            radius: radius.unwrap_or(self.radius),
            width: width.unwrap_or(self.width),
            height: height.unwrap_or(self.height),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CacheError::InvalidRequest(format!(
                "variant size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl Default for VariantSpec {
    fn default() -> Self {
        Self::new(16, 640, 960)
    }
}

/// Configuration for the image cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Disk budget in bytes
    pub max_cache_size: u64,
    pub memory_max_entries: u64,
    pub memory_max_bytes: u64,
    /// Size of the worker pool for fetch and render jobs
    pub workers: usize,
    pub fetch_timeout_secs: u64,
    pub variants_enabled: bool,
    pub default_variant: VariantSpec,
    pub user_agent: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/images"),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            memory_max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            workers: 4,
            fetch_timeout_secs: 30,
            variants_enabled: true,
            default_variant: VariantSpec::default(),
            user_agent: concat!("image-cache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl CacheConfig {
    /// Defaults overlaid with any environment variables that parse
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let default_variant = VariantSpec {
            radius: parse_var("VARIANT_RADIUS").unwrap_or(defaults.default_variant.radius),
            width: parse_var("VARIANT_WIDTH").unwrap_or(defaults.default_variant.width),
            height: parse_var("VARIANT_HEIGHT").unwrap_or(defaults.default_variant.height),
        };

        Self {
            cache_dir,
            max_cache_size: parse_var("MAX_CACHE_SIZE").unwrap_or(defaults.max_cache_size),
            memory_max_entries: parse_var("MEMORY_MAX_ENTRIES")
                .unwrap_or(defaults.memory_max_entries),
            memory_max_bytes: parse_var("MEMORY_MAX_BYTES").unwrap_or(defaults.memory_max_bytes),
            workers: parse_var("CACHE_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.workers),
            fetch_timeout_secs: parse_var("FETCH_TIMEOUT_SECS")
                .unwrap_or(defaults.fetch_timeout_secs),
            variants_enabled: parse_var("VARIANTS_ENABLED").unwrap_or(defaults.variants_enabled),
            default_variant,
            user_agent: env::var("USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Settings read on every operation and writable while the cache runs
pub(crate) struct RuntimeSettings {
    max_cache_size: AtomicU64,
    variants_enabled: AtomicBool,
    default_variant: RwLock<VariantSpec>,
}

impl RuntimeSettings {
    pub(crate) fn new(config: &CacheConfig) -> Self {
        Self {
            max_cache_size: AtomicU64::new(config.max_cache_size),
            variants_enabled: AtomicBool::new(config.variants_enabled),
            default_variant: RwLock::new(config.default_variant),
        }
    }

    pub(crate) fn max_cache_size(&self) -> u64 {
        self.max_cache_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_cache_size(&self, bytes: u64) {
        self.max_cache_size.store(bytes, Ordering::Release);
    }

    pub(crate) fn variants_enabled(&self) -> bool {
        self.variants_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_variants_enabled(&self, enabled: bool) {
        self.variants_enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn default_variant(&self) -> VariantSpec {
        *self
            .default_variant
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_default_variant(&self, spec: VariantSpec) {
        *self
            .default_variant
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = spec;
    }
}
