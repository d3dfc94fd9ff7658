//! Configuration surface for a migration run.

use serde::{Deserialize, Serialize};

/// The handful of knobs a host passes to the driver at `Setup`.
///
/// Constructible from JSON (`serde_json::from_str`) so a host can ship it
/// alongside the rest of its machine configuration manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationConfig {
    pub xbzrle_enabled: bool,
    /// Rounded to a power-of-two number of pages when the cache is created.
    pub xbzrle_cache_bytes: u64,
    pub max_downtime_ns: u64,
    /// `0` means unlimited (no rate limiting).
    pub rate_limit_bytes_per_tick: u64,
    pub max_wait_ms: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            xbzrle_enabled: false,
            xbzrle_cache_bytes: 64 * 1024 * 1024,
            max_downtime_ns: 300_000_000,
            rate_limit_bytes_per_tick: 0,
            max_wait_ms: 50,
        }
    }
}
