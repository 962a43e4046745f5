//! Deterministic cache keys
//!
//! Keys are lowercase hex SHA-256 digests, so they are safe to use directly
//! as file names on every platform.

use sha2::{Digest, Sha256};

/// Cache key for an original image URL
pub fn key_for(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"original\0");
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache key for a rounded variant of `url`
///
/// The numeric parameters are hashed as fixed-width fields ahead of the URL,
/// so no two distinct tuples share a digest input.
pub fn derived_key_for(url: &str, radius: u32, width: u32, height: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"variant\0");
    hasher.update(radius.to_be_bytes());
    hasher.update(width.to_be_bytes());
    hasher.update(height.to_be_bytes());
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
