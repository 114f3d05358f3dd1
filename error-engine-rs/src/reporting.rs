//! External error reporting
//!
//! Ships single, batched, aggregated and correlated reports to an HTTP sink
//! with bearer-token authentication. Delivery is retried with exponential
//! backoff and abandoned quietly once the attempts run out; a reporting
//! outage must never surface on the request path.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::aggregation::AggregationEvent;
use crate::correlation::CorrelationEvent;
use crate::monitoring::{EngineStats, PipelineEvent};
use crate::types::{ErrorDetails, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

/// Body of one POST to the reporting endpoint
#[derive(Debug, Clone)]
pub enum ReportPayload {
    Single(Box<ErrorDetails>),
    Batch(Vec<ErrorDetails>),
    Aggregated(AggregationEvent),
    Correlated(CorrelationEvent),
}

impl ReportPayload {
    pub fn to_json(&self) -> Result<Value> {
        let body = match self {
            ReportPayload::Single(error) => serde_json::to_value(error)?,
            ReportPayload::Batch(errors) => json!({ "errors": errors }),
            ReportPayload::Aggregated(event) => json!({
                "type": "aggregated",
                "key": event.key,
                "count": event.count,
                "firstOccurrence": event.first_occurrence,
                "lastOccurrence": event.last_occurrence,
                "error": event.error,
            }),
            ReportPayload::Correlated(event) => json!({
                "type": "correlated",
                "key": event.key,
                "count": event.count(),
                "errors": event.errors,
            }),
        };

        Ok(body)
    }

    fn kind(&self) -> &'static str {
        match self {
            ReportPayload::Single(_) => "single",
            ReportPayload::Batch(_) => "batch",
            ReportPayload::Aggregated(_) => "aggregated",
            ReportPayload::Correlated(_) => "correlated",
        }
    }
}

pub struct Reporter {
    config: ReportingConfig,
    client: reqwest::Client,
    stats: Arc<EngineStats>,
}

impl Reporter {
    pub fn new(config: ReportingConfig, stats: Arc<EngineStats>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { config, client, stats })
    }

    /// True when reports would actually be sent
    pub fn is_active(&self) -> bool {
        self.config.enabled && self.config.endpoint.is_some()
    }

    /// Sends the payload, retrying failed attempts. Returns true on delivery.
    pub async fn report(&self, payload: &ReportPayload) -> bool {
        let endpoint = match (&self.config.endpoint, self.config.enabled) {
            (Some(endpoint), true) => endpoint,
            _ => return false,
        };

        let body = match payload.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(kind = payload.kind(), error = %e, "Failed to serialize error report");
                self.stats.record(PipelineEvent::ReportFailed);
                return false;
            }
        };

        let attempts = self.config.max_attempts.max(1);
        for attempt in 0..attempts {
            match self.send(endpoint, &body).await {
                Ok(()) => {
                    debug!(kind = payload.kind(), attempt = attempt + 1, "Error report delivered");
                    self.stats.record(PipelineEvent::ReportSent);
                    return true;
                }
                Err(e) => {
                    warn!(
                        kind = payload.kind(),
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Error report attempt failed"
                    );

                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        error!(kind = payload.kind(), attempts, "Giving up on error report");
        self.stats.record(PipelineEvent::ReportFailed);
        false
    }

    /// Wait after failed attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }

    async fn send(&self, endpoint: &str, body: &Value) -> Result<()> {
        let mut request = self.client.post(endpoint).json(body);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorContext;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reporter(server: &MockServer) -> Reporter {
        Reporter::new(
            ReportingConfig {
                enabled: true,
                endpoint: Some(format!("{}/errors", server.uri())),
                api_key: Some("secret-key".to_string()),
                max_attempts: 3,
                backoff_base_ms: 10,
                timeout_ms: 2_000,
            },
            Arc::new(EngineStats::new()),
        )
        .unwrap()
    }

    fn sample_error() -> ErrorDetails {
        ErrorDetails::from_parts("timeout".into(), ErrorContext::new().code("NET_TIMEOUT"))
    }

    #[tokio::test]
    async fn test_single_report_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/errors"))
            .and(header("Authorization", "Bearer secret-key"))
            .and(body_partial_json(json!({ "code": "NET_TIMEOUT" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = reporter(&server);
        assert!(reporter.report(&ReportPayload::Single(Box::new(sample_error()))).await);
        assert_eq!(reporter.stats.get(PipelineEvent::ReportSent), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = reporter(&server);
        assert!(reporter.report(&ReportPayload::Batch(vec![sample_error()])).await);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let reporter = reporter(&server);
        assert!(!reporter.report(&ReportPayload::Single(Box::new(sample_error()))).await);
        assert_eq!(reporter.stats.get(PipelineEvent::ReportFailed), 1);
    }

    #[tokio::test]
    async fn test_disabled_reporter_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let reporter = Reporter::new(
            ReportingConfig {
                enabled: false,
                endpoint: Some(server.uri()),
                ..Default::default()
            },
            Arc::new(EngineStats::new()),
        )
        .unwrap();

        assert!(!reporter.is_active());
        assert!(!reporter.report(&ReportPayload::Batch(vec![])).await);
    }

    #[test]
    fn test_payload_shapes() {
        let error = sample_error();

        let aggregated = ReportPayload::Aggregated(AggregationEvent {
            key: "system:NET_TIMEOUT".to_string(),
            count: 11,
            first_occurrence: Utc::now(),
            last_occurrence: Utc::now(),
            error: error.clone(),
        })
        .to_json()
        .unwrap();
        assert_eq!(aggregated["type"], "aggregated");
        assert_eq!(aggregated["count"], 11);
        assert_eq!(aggregated["error"]["code"], "NET_TIMEOUT");

        let correlated = ReportPayload::Correlated(CorrelationEvent {
            key: "correlationId:corr123".to_string(),
            errors: vec![error.clone(), error.clone()],
        })
        .to_json()
        .unwrap();
        assert_eq!(correlated["type"], "correlated");
        assert_eq!(correlated["count"], 2);
        assert_eq!(correlated["errors"].as_array().unwrap().len(), 2);

        let batch = ReportPayload::Batch(vec![error]).to_json().unwrap();
        assert!(batch.get("type").is_none());
        assert_eq!(batch["errors"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let reporter = Reporter::new(ReportingConfig::default(), Arc::new(EngineStats::new())).unwrap();
        assert_eq!(reporter.backoff(0), Duration::from_millis(1_000));
        assert_eq!(reporter.backoff(1), Duration::from_millis(2_000));
        assert_eq!(reporter.backoff(2), Duration::from_millis(4_000));
    }
}
