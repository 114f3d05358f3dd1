//! # Cross-Request Correlation
//!
//! Groups distinct errors that share an identifying context value (a
//! correlation id, request id, session, ...) within a bounded time span.
//! Once a group grows to `max_correlation_distance` members it is emitted
//! as a single correlation event and cleared.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::expiring::ExpiringMap;
use crate::types::ErrorDetails;

/// Configuration for error correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Context field names tried in order; the first present one forms the key
    pub keys: Vec<String>,
    pub correlation_window_ms: u64,
    /// Group size at which a correlation event fires
    pub max_correlation_distance: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            keys: vec![
                "correlationId".to_string(),
                "requestId".to_string(),
                "sessionId".to_string(),
                "userId".to_string(),
            ],
            correlation_window_ms: 5 * 60 * 1000,
            max_correlation_distance: 5,
        }
    }
}

/// A group of errors sharing one correlation key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationEvent {
    /// `field:value` the errors share
    pub key: String,
    pub errors: Vec<ErrorDetails>,
}

impl CorrelationEvent {
    pub fn count(&self) -> usize {
        self.errors.len()
    }
}

#[derive(Debug, Default)]
struct CorrelationWindow {
    entries: Vec<(Instant, ErrorDetails)>,
}

#[derive(Debug)]
pub struct Correlator {
    config: CorrelationConfig,
    windows: Mutex<ExpiringMap<String, CorrelationWindow>>,
}

impl Correlator {
    pub fn new(config: CorrelationConfig) -> Self {
        let ttl = Duration::from_millis(config.correlation_window_ms);
        Self {
            config,
            windows: Mutex::new(ExpiringMap::new(ttl)),
        }
    }

    /// Derives `field:value` from the first configured field present on the error
    pub fn correlation_key(&self, error: &ErrorDetails) -> Option<String> {
        self.config
            .keys
            .iter()
            .find_map(|field| error.lookup_field(field).map(|value| format!("{}:{}", field, value)))
    }

    /// Adds the error to its correlation window, returning an event when the
    /// window reaches the configured size
    pub fn correlate(&self, error: &ErrorDetails) -> Option<CorrelationEvent> {
        let key = self.correlation_key(error)?;
        let span = Duration::from_millis(self.config.correlation_window_ms);
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.get_or_insert_with(key.clone(), CorrelationWindow::default);

        window.entries.retain(|(seen, _)| now.duration_since(*seen) <= span);
        window.entries.push((now, error.clone()));

        if window.entries.len() < self.config.max_correlation_distance {
            debug!(key = %key, size = %window.entries.len(), "Error added to correlation window");
            return None;
        }

        let errors: Vec<ErrorDetails> = window.entries.drain(..).map(|(_, e)| e).collect();
        windows.remove(key.as_str());

        info!(key = %key, count = %errors.len(), "Correlated errors detected");

        Some(CorrelationEvent { key, errors })
    }

    /// Number of errors currently waiting in a window
    pub fn pending(&self, key: &str) -> usize {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.get(key).map_or(0, |w| w.entries.len())
    }

    /// Drops windows whose members have all aged out
    pub fn sweep(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).sweep()
    }
}
