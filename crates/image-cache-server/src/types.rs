//! Request and response bodies for the image cache server

use image_cache::{CacheConfig, CacheStats, VariantSpec};
use serde::{Deserialize, Serialize};

/// Configuration for the server process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            cache: CacheConfig::default(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
}

/// Omitted shape fields fall back to the runtime default
#[derive(Debug, Deserialize)]
pub struct VariantQuery {
    pub url: String,
    pub radius: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PrefetchRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrefetchResponse {
    pub scheduled: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheSizeResponse {
    pub current_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct SetCacheSizeRequest {
    pub max_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetCacheSizeResponse {
    pub current_bytes: u64,
    pub max_bytes: u64,
    pub evicted: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct VariantSettingsRequest {
    pub enabled: Option<bool>,
    pub radius: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VariantSettingsResponse {
    pub enabled: bool,
    pub default_variant: VariantSpec,
}
