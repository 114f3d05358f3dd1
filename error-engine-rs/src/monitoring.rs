//! Pipeline counters for the error engine
//!
//! Every stage outcome is recorded twice: as a `metrics` counter for the
//! process-wide exporter and in an in-process [`EngineStats`] so the engine
//! can report on itself without a metrics backend installed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{EngineError, Result};

/// A countable pipeline outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Received,
    RateLimited,
    SampledOut,
    Duplicate,
    Processed,
    RecoverySuccess,
    RecoveryFailure,
    Aggregation,
    Correlation,
    Persisted,
    PersistFailure,
    ReportSent,
    ReportFailed,
    NotificationFailed,
}

impl PipelineEvent {
    pub fn metric_name(&self) -> &'static str {
        match self {
            PipelineEvent::Received => "error_engine.received",
            PipelineEvent::RateLimited => "error_engine.rate_limited",
            PipelineEvent::SampledOut => "error_engine.sampled_out",
            PipelineEvent::Duplicate => "error_engine.duplicates",
            PipelineEvent::Processed => "error_engine.processed",
            PipelineEvent::RecoverySuccess => "error_engine.recovery.success",
            PipelineEvent::RecoveryFailure => "error_engine.recovery.failure",
            PipelineEvent::Aggregation => "error_engine.aggregations",
            PipelineEvent::Correlation => "error_engine.correlations",
            PipelineEvent::Persisted => "error_engine.persisted",
            PipelineEvent::PersistFailure => "error_engine.persist_failures",
            PipelineEvent::ReportSent => "error_engine.reports.sent",
            PipelineEvent::ReportFailed => "error_engine.reports.failed",
            PipelineEvent::NotificationFailed => "error_engine.notifications.failed",
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineStats {
    received: AtomicU64,
    rate_limited: AtomicU64,
    sampled_out: AtomicU64,
    duplicates: AtomicU64,
    processed: AtomicU64,
    recovery_success: AtomicU64,
    recovery_failure: AtomicU64,
    aggregations: AtomicU64,
    correlations: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    reports_sent: AtomicU64,
    reports_failed: AtomicU64,
    notifications_failed: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: PipelineEvent) {
        self.record_n(event, 1);
    }

    pub fn record_n(&self, event: PipelineEvent, n: u64) {
        if n == 0 {
            return;
        }

        self.slot(event).fetch_add(n, Ordering::Relaxed);
        counter!(event.metric_name(), n);
    }

    pub fn get(&self, event: PipelineEvent) -> u64 {
        self.slot(event).load(Ordering::Relaxed)
    }

    fn slot(&self, event: PipelineEvent) -> &AtomicU64 {
        match event {
            PipelineEvent::Received => &self.received,
            PipelineEvent::RateLimited => &self.rate_limited,
            PipelineEvent::SampledOut => &self.sampled_out,
            PipelineEvent::Duplicate => &self.duplicates,
            PipelineEvent::Processed => &self.processed,
            PipelineEvent::RecoverySuccess => &self.recovery_success,
            PipelineEvent::RecoveryFailure => &self.recovery_failure,
            PipelineEvent::Aggregation => &self.aggregations,
            PipelineEvent::Correlation => &self.correlations,
            PipelineEvent::Persisted => &self.persisted,
            PipelineEvent::PersistFailure => &self.persist_failures,
            PipelineEvent::ReportSent => &self.reports_sent,
            PipelineEvent::ReportFailed => &self.reports_failed,
            PipelineEvent::NotificationFailed => &self.notifications_failed,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.get(PipelineEvent::Received),
            rate_limited: self.get(PipelineEvent::RateLimited),
            sampled_out: self.get(PipelineEvent::SampledOut),
            duplicates: self.get(PipelineEvent::Duplicate),
            processed: self.get(PipelineEvent::Processed),
            recovery_success: self.get(PipelineEvent::RecoverySuccess),
            recovery_failure: self.get(PipelineEvent::RecoveryFailure),
            aggregations: self.get(PipelineEvent::Aggregation),
            correlations: self.get(PipelineEvent::Correlation),
            persisted: self.get(PipelineEvent::Persisted),
            persist_failures: self.get(PipelineEvent::PersistFailure),
            reports_sent: self.get(PipelineEvent::ReportSent),
            reports_failed: self.get(PipelineEvent::ReportFailed),
            notifications_failed: self.get(PipelineEvent::NotificationFailed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub received: u64,
    pub rate_limited: u64,
    pub sampled_out: u64,
    pub duplicates: u64,
    pub processed: u64,
    pub recovery_success: u64,
    pub recovery_failure: u64,
    pub aggregations: u64,
    pub correlations: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub reports_sent: u64,
    pub reports_failed: u64,
    pub notifications_failed: u64,
}

/// Installs the Prometheus exporter as the global metrics recorder and
/// serves the scrape endpoint on `addr`. Must be called inside a tokio runtime.
pub fn install_prometheus_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Initialization(format!("Prometheus exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EngineStats::new();
        stats.record(PipelineEvent::Received);
        stats.record(PipelineEvent::Received);
        stats.record_n(PipelineEvent::Persisted, 100);
        stats.record_n(PipelineEvent::PersistFailure, 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.persisted, 100);
        assert_eq!(snapshot.persist_failures, 0);
        assert_eq!(snapshot.duplicates, 0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let stats = EngineStats::new();
        stats.record(PipelineEvent::RateLimited);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["rateLimited"], 1);
        assert_eq!(json["notificationsFailed"], 0);
    }
}
