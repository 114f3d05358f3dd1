//! # Error Engine
//!
//! Error handling and resilience engine for the fitness tracking backend.
//! Every failure raised by the API is funneled through one pipeline that
//! decides what happens next.
//!
//! ## Features
//!
//! - Per-`category:source` throttling and severity/category sampling
//! - Duplicate suppression with a TTL cache
//! - Context enrichment with payload sanitization and system metrics
//! - Correlation of errors sharing a request, session or user
//! - Burst aggregation with rollup reports
//! - Category-specific recovery behind keyed circuit breakers with
//!   exponential backoff
//! - Severity-routed notification fan-out
//! - Batched persistence to PostgreSQL and retrying external reporting
//!

pub mod aggregation;
pub mod audit;
pub mod circuit_breaker;
pub mod correlation;
pub mod dedup;
pub mod engine;
pub mod enrichment;
pub mod events;
pub mod expiring;
pub mod logging;
pub mod monitoring;
pub mod notification;
pub mod persistence;
pub mod rate_limit;
pub mod recovery;
pub mod reporting;
pub mod retry;
pub mod sampling;
pub mod sanitization;
pub mod settings;
pub mod types;

// Re-export commonly used types
pub use engine::{EngineBuilder, ErrorHandlingEngine, PipelineOutcome};
pub use types::{EngineError, ErrorCategory, ErrorContext, ErrorDetails, ErrorInput, Result, Severity};
pub use settings::EngineConfig;
pub use logging::{init_logging, LoggingConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use recovery::{RecoveryActions, RecoveryEngine, RecoveryStrategy, RecoveryStrategyConfig};
pub use persistence::{BatchPersister, ErrorStore, PostgresErrorStore};
pub use notification::{NotificationChannel, NotificationDispatcher, NotificationSender};
pub use reporting::{ReportPayload, Reporter};
pub use audit::AuditLogger;

/// Loads configuration from `.env` and the environment, then starts logging
pub fn init() -> Result<EngineConfig> {
    let config = EngineConfig::load(None)?;
    init_logging(Some(config.logging.clone()))?;
    Ok(config)
}

/// Starts logging from an already assembled configuration source
pub fn init_with_config(config: config::Config) -> Result<EngineConfig> {
    let engine_config = EngineConfig::try_from(config)?;
    engine_config.validate()?;

    init_logging(Some(engine_config.logging.clone()))?;
    Ok(engine_config)
}
