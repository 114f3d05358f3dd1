//! # Error Volume Throttling
//!
//! Per `category:source` fixed windows counting how many errors arrived.
//! Errors beyond the category budget are dropped silently until the window
//! rolls over.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::expiring::ExpiringMap;
use crate::types::{ErrorCategory, ErrorDetails};

/// Configuration for error throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of one counting window
    pub window_ms: u64,
    /// Budget per window for categories without an explicit limit
    pub default_limit: u32,
    /// Per-category budgets per window
    pub category_limits: HashMap<ErrorCategory, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut category_limits = HashMap::new();
        category_limits.insert(ErrorCategory::Validation, 200);
        category_limits.insert(ErrorCategory::Security, 1000);
        category_limits.insert(ErrorCategory::Database, 50);

        Self {
            window_ms: 60_000,
            default_limit: 100,
            category_limits,
        }
    }
}

#[derive(Debug)]
struct RateLimitWindow {
    count: u32,
    window_start: Instant,
}

/// Sliding per-key counters deciding which errors get processed
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<ExpiringMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        // Windows idle for two full periods carry no information any more
        let ttl = Duration::from_millis(config.window_ms.saturating_mul(2));
        Self {
            config,
            windows: Mutex::new(ExpiringMap::new(ttl)),
        }
    }

    fn limit_for(&self, category: ErrorCategory) -> u32 {
        self.config
            .category_limits
            .get(&category)
            .copied()
            .unwrap_or(self.config.default_limit)
    }

    /// Returns true if the error fits in its window's budget.
    ///
    /// Rejected errors still count, so every later call in the same window
    /// keeps seeing the same decision.
    pub fn admit(&self, error: &ErrorDetails) -> bool {
        let key = error.rate_limit_key();
        let limit = self.limit_for(error.category);
        let window_len = Duration::from_millis(self.config.window_ms);
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.get_or_insert_with(key.clone(), || RateLimitWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(window.window_start) > window_len {
            window.count = 0;
            window.window_start = now;
        }

        window.count = window.count.saturating_add(1);

        if window.count > limit {
            debug!(
                key = %key,
                count = %window.count,
                limit = %limit,
                "Error throttled by rate limiter"
            );
            return false;
        }

        true
    }

    /// Current count in the key's window, if one is open
    pub fn current_count(&self, key: &str) -> Option<u32> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.get(key).map(|w| w.count)
    }

    /// Drops windows that have been idle long enough to be meaningless
    pub fn sweep(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).sweep()
    }
}
