//! # Context Enrichment
//!
//! Attaches service, process and request metadata to admitted errors.
//! Process metrics are only collected for CRITICAL errors since sampling
//! them is comparatively expensive. Enrichment is best-effort: a failing
//! enricher is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sysinfo::System;
use tracing::warn;

use crate::sanitization::sanitize_payload;
use crate::types::{ErrorDetails, Severity};

/// Configuration for error enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub service_name: String,
    pub environment: String,
    /// Capture a backtrace for HIGH and CRITICAL errors that arrive without one
    pub capture_backtraces: bool,
    /// Context keys holding raw request/response payloads
    pub payload_keys: Vec<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            service_name: "fitness-api".to_string(),
            environment: "development".to_string(),
            capture_backtraces: false,
            payload_keys: vec!["request".to_string(), "response".to_string()],
        }
    }
}

/// Process level metrics attached to critical errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub uptime_secs: u64,
}

/// Provider of system metrics for enrichment
pub trait SystemMetricsSource: Send + Sync {
    fn snapshot(&self) -> SystemMetrics;
}

/// Metrics source backed by `sysinfo`
pub struct SysinfoMetricsSource {
    system: Mutex<System>,
    started: Instant,
}

impl SysinfoMetricsSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();

        Self {
            system: Mutex::new(system),
            started: Instant::now(),
        }
    }
}

impl Default for SysinfoMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsSource for SysinfoMetricsSource {
    fn snapshot(&self) -> SystemMetrics {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        system.refresh_cpu_usage();

        SystemMetrics {
            cpu_usage_percent: system.global_cpu_usage(),
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// A pluggable enrichment step returning extra context fields
pub trait Enricher: Send + Sync {
    fn enrich(&self, error: &ErrorDetails) -> anyhow::Result<Map<String, Value>>;
}

impl<F> Enricher for F
where
    F: Fn(&ErrorDetails) -> anyhow::Result<Map<String, Value>> + Send + Sync,
{
    fn enrich(&self, error: &ErrorDetails) -> anyhow::Result<Map<String, Value>> {
        self(error)
    }
}

pub struct ContextEnricher {
    config: EnrichmentConfig,
    metrics: Arc<dyn SystemMetricsSource>,
    enrichers: Vec<Arc<dyn Enricher>>,
}

impl ContextEnricher {
    pub fn new(config: EnrichmentConfig, metrics: Arc<dyn SystemMetricsSource>) -> Self {
        Self {
            config,
            metrics,
            enrichers: Vec::new(),
        }
    }

    /// Appends a custom enricher; enrichers run in registration order
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn enrich(&self, error: &mut ErrorDetails) {
        // Caller supplied values win over engine metadata
        insert_absent(&mut error.context, "service", Value::from(self.config.service_name.clone()));
        insert_absent(&mut error.context, "environment", Value::from(self.config.environment.clone()));
        insert_absent(&mut error.context, "pid", Value::from(std::process::id()));

        for key in &self.config.payload_keys {
            if let Some(payload) = error.context.get(key) {
                let clean = sanitize_payload(payload);
                error.context.insert(key.clone(), clean);
            }
        }

        if error.severity == Severity::Critical {
            match serde_json::to_value(self.metrics.snapshot()) {
                Ok(system) => {
                    error.context.insert("system".to_string(), system);
                }
                Err(e) => warn!(error = %e, "Failed to serialize system metrics"),
            }
        }

        if self.config.capture_backtraces
            && error.stack.is_none()
            && error.severity >= Severity::High
        {
            error.stack = Some(format!("{:?}", backtrace::Backtrace::new()));
        }

        for (index, enricher) in self.enrichers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| enricher.enrich(error)));
            match outcome {
                Ok(Ok(fields)) => error.context.extend(fields),
                Ok(Err(e)) => warn!(
                    enricher = %index,
                    code = %error.code,
                    error = %e,
                    "Custom enricher failed"
                ),
                Err(_) => warn!(
                    enricher = %index,
                    code = %error.code,
                    "Custom enricher panicked"
                ),
            }
        }
    }
}

fn insert_absent(context: &mut Map<String, Value>, key: &str, value: Value) {
    if !context.contains_key(key) {
        context.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitization::REDACTED;
    use crate::types::ErrorContext;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedMetrics {
        calls: AtomicUsize,
    }

    impl SystemMetricsSource for FixedMetrics {
        fn snapshot(&self) -> SystemMetrics {
            self.calls.fetch_add(1, Ordering::SeqCst);
            SystemMetrics {
                cpu_usage_percent: 12.5,
                memory_used_bytes: 1024,
                memory_total_bytes: 4096,
                uptime_secs: 42,
            }
        }
    }

    fn enricher() -> (ContextEnricher, Arc<FixedMetrics>) {
        let metrics = Arc::new(FixedMetrics { calls: AtomicUsize::new(0) });
        (ContextEnricher::new(EnrichmentConfig::default(), metrics.clone()), metrics)
    }

    #[test]
    fn test_system_metrics_only_for_critical() {
        let (enricher, metrics) = enricher();

        let mut high = ErrorDetails::from_parts("slow".into(), ErrorContext::new().severity(Severity::High));
        enricher.enrich(&mut high);
        assert!(high.context.get("system").is_none());
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 0);

        let mut critical =
            ErrorDetails::from_parts("down".into(), ErrorContext::new().severity(Severity::Critical));
        enricher.enrich(&mut critical);
        assert_eq!(critical.context["system"]["uptime_secs"], 42);
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_payload_is_sanitized() {
        let (enricher, _) = enricher();
        let mut err = ErrorDetails::from_parts(
            "login failed".into(),
            ErrorContext::new().field(
                "request",
                json!({ "headers": { "authorization": "Bearer abc" }, "body": { "password": "pw" } }),
            ),
        );

        enricher.enrich(&mut err);

        assert_eq!(err.context["request"]["headers"]["authorization"], REDACTED);
        assert_eq!(err.context["request"]["body"]["password"], REDACTED);
        assert_eq!(err.context["service"], "fitness-api");
    }

    #[test]
    fn test_failing_enricher_is_skipped() {
        let (enricher, _) = enricher();
        let failing = |_: &ErrorDetails| -> anyhow::Result<Map<String, Value>> {
            Err(anyhow::anyhow!("geoip lookup unavailable"))
        };
        let tagging = |e: &ErrorDetails| -> anyhow::Result<Map<String, Value>> {
            let mut fields = Map::new();
            fields.insert("tagged_code".to_string(), Value::from(e.code.clone()));
            Ok(fields)
        };
        let panicking = |_: &ErrorDetails| -> anyhow::Result<Map<String, Value>> {
            panic!("enricher bug")
        };
        let enricher = enricher
            .with_enricher(Arc::new(failing))
            .with_enricher(Arc::new(panicking))
            .with_enricher(Arc::new(tagging));

        let mut err = ErrorDetails::from_parts("x".into(), ErrorContext::new().code("WORKOUT_404"));
        enricher.enrich(&mut err);

        assert_eq!(err.context["tagged_code"], "WORKOUT_404");
    }

    #[test]
    fn test_caller_context_wins() {
        let (enricher, _) = enricher();
        let mut err = ErrorDetails::from_parts("x".into(), ErrorContext::new().field("service", "users-api"));

        enricher.enrich(&mut err);

        assert_eq!(err.context["service"], "users-api");
        assert_eq!(err.context["environment"], "development");
    }
}
