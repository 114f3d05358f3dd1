//! Engine configuration
//!
//! Values are layered: built-in defaults, then an optional config file, then
//! `ERROR_ENGINE__*` environment variables (`__` separates nested keys, e.g.
//! `ERROR_ENGINE__BATCH__BATCH_SIZE=250`). A `.env` file is read first.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregation::AggregationConfig;
use crate::correlation::CorrelationConfig;
use crate::dedup::CacheConfig;
use crate::enrichment::EnrichmentConfig;
use crate::logging::LoggingConfig;
use crate::notification::NotificationConfig;
use crate::persistence::BatchConfig;
use crate::rate_limit::RateLimitConfig;
use crate::recovery::{default_recovery_configs, RecoveryStrategyConfig};
use crate::reporting::ReportingConfig;
use crate::sampling::SamplingConfig;
use crate::types::{EngineError, ErrorCategory, Result};

pub const ENV_PREFIX: &str = "ERROR_ENGINE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub sampling: SamplingConfig,
    pub cache: CacheConfig,
    pub correlation: CorrelationConfig,
    pub aggregation: AggregationConfig,
    pub recovery: HashMap<ErrorCategory, RecoveryStrategyConfig>,
    pub batch: BatchConfig,
    pub reporting: ReportingConfig,
    pub notification: NotificationConfig,
    pub enrichment: EnrichmentConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            sampling: SamplingConfig::default(),
            cache: CacheConfig::default(),
            correlation: CorrelationConfig::default(),
            aggregation: AggregationConfig::default(),
            recovery: default_recovery_configs(),
            batch: BatchConfig::default(),
            reporting: ReportingConfig::default(),
            notification: NotificationConfig::default(),
            enrichment: EnrichmentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads and validates the configuration.
    ///
    /// `path` names a config file without extension requirements; a missing
    /// file is not an error.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let engine_config = Self::try_from(builder.build()?)?;
        engine_config.validate()?;

        debug!(?path, "Engine configuration loaded");
        Ok(engine_config)
    }

    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let rates = std::iter::once(self.sampling.default_rate)
            .chain(self.sampling.severity_rates.values().copied())
            .chain(self.sampling.category_rates.values().copied());
        for rate in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(invalid(format!("sampling rate {} is outside [0, 1]", rate)));
            }
        }

        if self.rate_limit.window_ms == 0 {
            return Err(invalid("rate_limit.window_ms must be positive"));
        }
        if self.cache.ttl_ms == 0 || self.cache.sweep_interval_ms == 0 {
            return Err(invalid("cache ttl and sweep interval must be positive"));
        }
        if self.correlation.correlation_window_ms == 0 || self.correlation.max_correlation_distance == 0 {
            return Err(invalid("correlation window and distance must be positive"));
        }
        if self.aggregation.error_aggregation_window_ms == 0 {
            return Err(invalid("aggregation.error_aggregation_window_ms must be positive"));
        }
        if self.batch.batch_size == 0 || self.batch.batch_timeout_ms == 0 {
            return Err(invalid("batch size and timeout must be positive"));
        }

        for (category, recovery) in &self.recovery {
            if recovery.enabled && recovery.max_attempts == 0 {
                return Err(invalid(format!("recovery.{}.max_attempts must be positive", category)));
            }
            if recovery.base_delay_ms > recovery.max_delay_ms {
                return Err(invalid(format!(
                    "recovery.{}.base_delay_ms exceeds max_delay_ms",
                    category
                )));
            }
        }

        if self.reporting.enabled {
            if self.reporting.endpoint.is_none() {
                return Err(invalid("reporting is enabled without an endpoint"));
            }
            if self.reporting.max_attempts == 0 {
                return Err(invalid("reporting.max_attempts must be positive"));
            }
        }

        Ok(())
    }
}

impl TryFrom<config::Config> for EngineConfig {
    type Error = EngineError;

    fn try_from(cfg: config::Config) -> Result<Self> {
        Ok(cfg.try_deserialize()?)
    }
}

fn invalid<S: Into<String>>(reason: S) -> EngineError {
    EngineError::Configuration(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.batch.batch_size, 100);
        assert_eq!(config.cache.ttl_ms, 3_600_000);
        assert!(config.recovery.contains_key(&ErrorCategory::Database));
    }

    #[test]
    fn test_try_from_overrides() {
        let cfg = config::Config::builder()
            .set_override("batch.batch_size", 25)
            .unwrap()
            .set_override("aggregation.error_aggregation_threshold", 3)
            .unwrap()
            .set_override("sampling.severity_rates.low", 0.25)
            .unwrap()
            .build()
            .unwrap();

        let config = assert_ok!(EngineConfig::try_from(cfg));
        assert_eq!(config.batch.batch_size, 25);
        assert_eq!(config.batch.batch_timeout_ms, 5_000);
        assert_eq!(config.aggregation.error_aggregation_threshold, 3);
        assert_eq!(config.sampling.severity_rates.get(&Severity::Low), Some(&0.25));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("error-engine-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
            [correlation]
            max_correlation_distance = 8

            [reporting]
            enabled = true
            endpoint = "https://errors.example.com/ingest"
            "#,
        )
        .unwrap();

        let config = assert_ok!(EngineConfig::load(path.to_str()));
        assert_eq!(config.correlation.max_correlation_distance, 8);
        assert_eq!(config.reporting.endpoint.as_deref(), Some("https://errors.example.com/ingest"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = assert_ok!(EngineConfig::load(Some("/nonexistent/error-engine")));
        assert_eq!(config.rate_limit.default_limit, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.sampling.default_rate = 1.5;
        assert_err!(config.validate());

        let mut config = EngineConfig::default();
        config.batch.batch_size = 0;
        assert_err!(config.validate());

        let mut config = EngineConfig::default();
        config.reporting.enabled = true;
        assert_err!(config.validate());

        let mut config = EngineConfig::default();
        if let Some(database) = config.recovery.get_mut(&ErrorCategory::Database) {
            database.max_attempts = 0;
        }
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }
}
