//! # Error Handling Engine
//!
//! The single pipeline every failure is funneled through:
//!
//! 1. rate limiting per `category:source`
//! 2. sampling by severity and category
//! 3. duplicate suppression per `category:code:source`
//! 4. enrichment and structured logging
//! 5. recovery, concurrently with aggregation, correlation, notification
//!    and audit
//! 6. persistence and external reporting, once recovery has settled
//! 7. `error` event to subscribers
//!
//! Nothing in the pipeline propagates a failure to the caller. Each stage
//! logs and counts its own problems.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregation::{AggregationEvent, Aggregator};
use crate::audit::{audit_details, requires_audit, AuditLogger, TracingAuditLogger, ERROR_OCCURRED};
use crate::circuit_breaker::CircuitState;
use crate::correlation::{CorrelationEvent, Correlator};
use crate::dedup::Deduplicator;
use crate::enrichment::{ContextEnricher, Enricher, SysinfoMetricsSource, SystemMetricsSource};
use crate::events::{EventHub, SubscriptionId};
use crate::logging::log_error_details;
use crate::monitoring::{EngineStats, PipelineEvent, StatsSnapshot};
use crate::notification::{LogSender, NotificationDispatcher, NotificationSender};
use crate::persistence::{BatchPersister, ErrorStore};
use crate::rate_limit::RateLimiter;
use crate::recovery::{DefaultRecoveryActions, RecoveryActions, RecoveryEngine};
use crate::reporting::{ReportPayload, Reporter};
use crate::sampling::{Sampler, SamplerStats};
use crate::settings::EngineConfig;
use crate::types::{ErrorCategory, ErrorContext, ErrorDetails, ErrorInput, Result};

/// Where an error left the pipeline
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    RateLimited,
    SampledOut,
    Duplicate,
    Processed(Box<ErrorDetails>),
}

impl PipelineOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, PipelineOutcome::Processed(_))
    }

    /// The final error record, for processed errors
    pub fn details(&self) -> Option<&ErrorDetails> {
        match self {
            PipelineOutcome::Processed(error) => Some(error),
            _ => None,
        }
    }
}

/// Assembles an engine from configuration and collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn ErrorStore>>,
    recovery_actions: Option<Arc<dyn RecoveryActions>>,
    notification_sender: Option<Arc<dyn NotificationSender>>,
    channel_senders: Vec<(String, Arc<dyn NotificationSender>)>,
    audit: Option<Arc<dyn AuditLogger>>,
    metrics_source: Option<Arc<dyn SystemMetricsSource>>,
    enrichers: Vec<Arc<dyn Enricher>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            recovery_actions: None,
            notification_sender: None,
            channel_senders: Vec::new(),
            audit: None,
            metrics_source: None,
            enrichers: Vec::new(),
        }
    }

    /// Enables persistence; also backs the database connectivity check
    pub fn store(mut self, store: Arc<dyn ErrorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn recovery_actions(mut self, actions: Arc<dyn RecoveryActions>) -> Self {
        self.recovery_actions = Some(actions);
        self
    }

    /// Transport used for channels without a dedicated sender
    pub fn notification_sender(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.notification_sender = Some(sender);
        self
    }

    pub fn channel_sender<S: Into<String>>(mut self, channel: S, sender: Arc<dyn NotificationSender>) -> Self {
        self.channel_senders.push((channel.into(), sender));
        self
    }

    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn metrics_source(mut self, source: Arc<dyn SystemMetricsSource>) -> Self {
        self.metrics_source = Some(source);
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn build(self) -> Result<Arc<ErrorHandlingEngine>> {
        self.config.validate()?;

        let config = self.config;
        let stats = Arc::new(EngineStats::new());

        let metrics_source = self
            .metrics_source
            .unwrap_or_else(|| Arc::new(SysinfoMetricsSource::new()));
        let enricher = self
            .enrichers
            .into_iter()
            .fold(ContextEnricher::new(config.enrichment.clone(), metrics_source), |enricher, extra| {
                enricher.with_enricher(extra)
            });

        let recovery_actions = self
            .recovery_actions
            .unwrap_or_else(|| Arc::new(DefaultRecoveryActions::new(self.store.clone())));

        let notifier = self.channel_senders.into_iter().fold(
            NotificationDispatcher::new(
                config.notification.clone(),
                self.notification_sender.unwrap_or_else(|| Arc::new(LogSender)),
                stats.clone(),
            ),
            |notifier, (channel, sender)| notifier.with_sender(channel, sender),
        );

        let persister = match self.store {
            Some(store) => Some(BatchPersister::new(store, config.batch.clone(), stats.clone())),
            None => {
                info!("No error store configured, persistence disabled");
                None
            }
        };

        let engine = ErrorHandlingEngine {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            sampler: Sampler::new(config.sampling.clone()),
            dedup: Deduplicator::new(&config.cache),
            enricher,
            correlator: Correlator::new(config.correlation.clone()),
            aggregator: Aggregator::new(config.aggregation.clone()),
            recovery: RecoveryEngine::new(&config.recovery, recovery_actions),
            notifier,
            persister,
            reporter: Reporter::new(config.reporting.clone(), stats.clone())?,
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditLogger)),
            events: EventHub::new(),
            stats,
            maintenance: Mutex::new(None),
            config,
        };

        Ok(Arc::new(engine))
    }
}

pub struct ErrorHandlingEngine {
    config: EngineConfig,
    rate_limiter: RateLimiter,
    sampler: Sampler,
    dedup: Deduplicator,
    enricher: ContextEnricher,
    correlator: Correlator,
    aggregator: Aggregator,
    recovery: RecoveryEngine,
    notifier: NotificationDispatcher,
    persister: Option<Arc<BatchPersister>>,
    reporter: Reporter,
    audit: Arc<dyn AuditLogger>,
    events: EventHub,
    stats: Arc<EngineStats>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ErrorHandlingEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fire-and-forget entry point. The pipeline runs on its own task; the
    /// handle may be awaited or dropped.
    pub fn handle_error<I>(self: &Arc<Self>, input: I, context: ErrorContext) -> JoinHandle<PipelineOutcome>
    where
        I: Into<ErrorInput>,
    {
        let engine = Arc::clone(self);
        let input = input.into();
        tokio::spawn(async move { engine.process_error(input, context).await })
    }

    /// Runs the whole pipeline for one error and reports where it stopped
    pub async fn process_error<I>(&self, input: I, context: ErrorContext) -> PipelineOutcome
    where
        I: Into<ErrorInput>,
    {
        let error = ErrorDetails::from_parts(input.into(), context);
        self.run_pipeline(error, true).await
    }

    /// Handles several errors concurrently. Admitted errors are reported
    /// together as one batch instead of individually.
    pub async fn handle_errors<I>(&self, errors: Vec<(I, ErrorContext)>) -> Vec<PipelineOutcome>
    where
        I: Into<ErrorInput>,
    {
        let pipelines = errors.into_iter().map(|(input, context)| {
            let error = ErrorDetails::from_parts(input.into(), context);
            self.run_pipeline(error, false)
        });
        let outcomes = join_all(pipelines).await;

        if self.reporter.is_active() {
            let processed: Vec<ErrorDetails> = outcomes
                .iter()
                .filter_map(PipelineOutcome::details)
                .cloned()
                .collect();
            if !processed.is_empty() {
                self.reporter.report(&ReportPayload::Batch(processed)).await;
            }
        }

        outcomes
    }

    async fn run_pipeline(&self, mut error: ErrorDetails, report_individually: bool) -> PipelineOutcome {
        self.stats.record(PipelineEvent::Received);

        if !self.rate_limiter.admit(&error) {
            self.stats.record(PipelineEvent::RateLimited);
            return PipelineOutcome::RateLimited;
        }

        if !self.sampler.should_process(&error) {
            self.stats.record(PipelineEvent::SampledOut);
            return PipelineOutcome::SampledOut;
        }

        if self.dedup.is_duplicate(&error) {
            self.stats.record(PipelineEvent::Duplicate);
            return PipelineOutcome::Duplicate;
        }
        self.dedup.remember(&error);

        self.enricher.enrich(&mut error);
        log_error_details(&error);

        let snapshot = error.clone();
        tokio::join!(
            self.recover(&mut error),
            self.group(&snapshot),
            self.notify(&snapshot),
            self.record_audit(&snapshot),
        );

        // The record is final from here on
        let error = error;
        tokio::join!(self.persist(&error), async {
            if report_individually && self.reporter.is_active() {
                self.reporter
                    .report(&ReportPayload::Single(Box::new(error.clone())))
                    .await;
            }
        });

        self.stats.record(PipelineEvent::Processed);
        self.events.errors.emit(&error);

        PipelineOutcome::Processed(Box::new(error))
    }

    async fn recover(&self, error: &mut ErrorDetails) {
        let recovered = self.recovery.attempt_recovery(error).await;
        if error.recovery_attempted {
            let event = if recovered {
                PipelineEvent::RecoverySuccess
            } else {
                PipelineEvent::RecoveryFailure
            };
            self.stats.record(event);
        }
    }

    async fn group(&self, error: &ErrorDetails) {
        if let Some(event) = self.aggregator.track(error) {
            self.on_aggregated(event).await;
        }

        if let Some(event) = self.correlator.correlate(error) {
            self.on_correlated(event).await;
        }
    }

    async fn on_aggregated(&self, event: AggregationEvent) {
        self.stats.record(PipelineEvent::Aggregation);
        self.events.aggregations.emit(&event);

        if self.reporter.is_active() {
            self.reporter.report(&ReportPayload::Aggregated(event)).await;
        }
    }

    async fn on_correlated(&self, event: CorrelationEvent) {
        self.stats.record(PipelineEvent::Correlation);
        self.events.correlations.emit(&event);

        if self.reporter.is_active() {
            self.reporter.report(&ReportPayload::Correlated(event)).await;
        }
    }

    async fn notify(&self, error: &ErrorDetails) {
        let report = self.notifier.notify(error).await;
        debug!(
            error_id = %error.id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Notifications dispatched"
        );
    }

    async fn record_audit(&self, error: &ErrorDetails) {
        if !requires_audit(error) {
            return;
        }

        let Some(user_id) = error.user_id.as_deref() else {
            return;
        };

        if let Err(e) = self
            .audit
            .log_event(user_id, ERROR_OCCURRED, "error", audit_details(error))
            .await
        {
            warn!(error_id = %error.id, error = %e, "Failed to write audit event");
        }
    }

    async fn persist(&self, error: &ErrorDetails) {
        if let Some(persister) = &self.persister {
            persister.enqueue(error.clone()).await;
        }
    }

    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ErrorDetails) + Send + Sync + 'static,
    {
        self.events.errors.subscribe(callback)
    }

    pub fn off_error(&self, id: SubscriptionId) -> bool {
        self.events.errors.unsubscribe(id)
    }

    pub fn on_error_aggregated<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AggregationEvent) + Send + Sync + 'static,
    {
        self.events.aggregations.subscribe(callback)
    }

    pub fn off_error_aggregated(&self, id: SubscriptionId) -> bool {
        self.events.aggregations.unsubscribe(id)
    }

    pub fn on_errors_correlated<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CorrelationEvent) + Send + Sync + 'static,
    {
        self.events.correlations.subscribe(callback)
    }

    pub fn off_errors_correlated(&self, id: SubscriptionId) -> bool {
        self.events.correlations.unsubscribe(id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sampler_stats(&self) -> SamplerStats {
        self.sampler.stats()
    }

    pub fn circuit_state(&self, category: ErrorCategory, source: &str) -> CircuitState {
        self.recovery.circuit_state(category, source)
    }

    /// Errors queued for the next persistence batch
    pub fn pending_persistence(&self) -> usize {
        self.persister.as_ref().map_or(0, |persister| persister.pending())
    }

    /// Evicts expired entries from every keyed map. Returns how many went.
    pub fn sweep(&self) -> usize {
        let evicted = self.dedup.sweep()
            + self.rate_limiter.sweep()
            + self.correlator.sweep()
            + self.aggregator.sweep()
            + self.recovery.sweep();

        debug!(evicted, "Maintenance sweep finished");
        evicted
    }

    /// Starts the periodic sweep. The task stops once the engine is dropped
    /// or shut down; calling this twice does nothing.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let engine = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.cache.sweep_interval_ms);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match engine.upgrade() {
                    Some(engine) => {
                        engine.sweep();
                    }
                    None => break,
                }
            }
        }));
    }

    /// Stops maintenance and writes out the pending persistence batch
    pub async fn shutdown(&self) {
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        if let Some(persister) = &self.persister {
            let rows = persister.flush().await;
            info!(rows, "Error engine shut down");
        }
    }
}

impl Drop for ErrorHandlingEngine {
    fn drop(&mut self) {
        if let Some(handle) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
