//! # Duplicate Suppression
//!
//! Short-lived cache keyed by `category:code:source`. The first occurrence of
//! a signature is processed in full; later ones only bump the cached hit
//! counter until the entry ages out.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expiring::ExpiringMap;
use crate::types::ErrorDetails;

/// Configuration for the duplicate cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time after which a cached signature is forgotten
    pub ttl_ms: u64,
    /// Interval of the background maintenance sweep
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60 * 60 * 1000,
            sweep_interval_ms: 30 * 60 * 1000,
        }
    }
}

/// The representative occurrence of a cached signature
#[derive(Debug, Clone)]
pub struct CachedError {
    pub error: ErrorDetails,
    pub hits: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Deduplicator {
    cache: Mutex<ExpiringMap<String, CachedError>>,
}

impl Deduplicator {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cache: Mutex::new(ExpiringMap::new(Duration::from_millis(config.ttl_ms))),
        }
    }

    /// Returns true if the signature was seen within the TTL, recording the hit
    pub fn is_duplicate(&self, error: &ErrorDetails) -> bool {
        let key = error.cache_key();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        // Entries past the TTL but not yet swept count as absent
        if cache.is_expired(key.as_str()) {
            cache.remove(key.as_str());
            return false;
        }

        match cache.get_mut(key.as_str()) {
            Some(cached) => {
                cached.hits += 1;
                cached.last_seen = Utc::now();
                let hits = cached.hits;
                cache.touch(key.as_str());
                debug!(key = %key, hits = %hits, "Duplicate error suppressed");
                true
            }
            None => false,
        }
    }

    /// Caches the error as the representative of its signature
    pub fn remember(&self, error: &ErrorDetails) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            error.cache_key(),
            CachedError {
                error: error.clone(),
                hits: 1,
                last_seen: Utc::now(),
            },
        );
    }

    pub fn hits(&self, key: &str) -> Option<u64> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).map(|cached| cached.hits)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts signatures not seen within the TTL
    pub fn sweep(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).sweep()
    }
}
