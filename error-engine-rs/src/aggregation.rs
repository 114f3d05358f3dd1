//! # Burst Aggregation
//!
//! Counts repeated occurrences of the same `category:code` signature and
//! raises a rollup event when a burst crosses the threshold. The window
//! gates firing as well as the count: slow background noise never
//! aggregates however high its total gets.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::expiring::ExpiringMap;
use crate::types::ErrorDetails;

/// Configuration for error aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub error_aggregation_threshold: u64,
    /// Maximum gap between consecutive occurrences for a burst
    pub error_aggregation_window_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            error_aggregation_threshold: 10,
            error_aggregation_window_ms: 60_000,
        }
    }
}

/// Rollup of a burst of identical errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationEvent {
    /// `category:code` of the burst
    pub key: String,
    pub count: u64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    /// The occurrence that triggered the rollup
    pub error: ErrorDetails,
}

#[derive(Debug)]
struct Occurrences {
    count: u64,
    first_occurrence: DateTime<Utc>,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct Aggregator {
    config: AggregationConfig,
    counters: Mutex<ExpiringMap<String, Occurrences>>,
}

impl Aggregator {
    pub fn new(config: AggregationConfig) -> Self {
        // Past one window of silence a counter can never fire again without
        // starting over, so it is safe to evict
        let ttl = Duration::from_millis(config.error_aggregation_window_ms);
        Self {
            config,
            counters: Mutex::new(ExpiringMap::new(ttl)),
        }
    }

    /// Records an occurrence, returning a rollup if it completes a burst.
    ///
    /// The threshold is compared against the occurrences seen before this
    /// one; the event's count includes the current occurrence.
    pub fn track(&self, error: &ErrorDetails) -> Option<AggregationEvent> {
        let key = error.aggregation_key();
        let window = Duration::from_millis(self.config.error_aggregation_window_ms);
        let now = Instant::now();

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.get_or_insert_with(key.clone(), || Occurrences {
            count: 0,
            first_occurrence: error.timestamp,
            last_seen: now,
        });

        let gap = now.duration_since(entry.last_seen);
        let previous = entry.count;

        if previous == 0 {
            entry.first_occurrence = error.timestamp;
        }
        entry.count += 1;
        entry.last_seen = now;

        if previous < self.config.error_aggregation_threshold || gap > window {
            return None;
        }

        let event = AggregationEvent {
            key: key.clone(),
            count: entry.count,
            first_occurrence: entry.first_occurrence,
            last_occurrence: error.timestamp,
            error: error.clone(),
        };
        entry.count = 0;

        info!(
            key = %key,
            count = %event.count,
            "Error burst aggregated"
        );

        Some(event)
    }

    /// Occurrences counted since the last rollup
    pub fn count(&self, key: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(key).map_or(0, |o| o.count)
    }

    pub fn sweep(&self) -> usize {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).sweep()
    }
}
