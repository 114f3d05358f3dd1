//! # Structured Logging
//!
//! Subscriber setup for services embedding the engine, and the severity
//! mapping used when the engine logs a handled error.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{EngineError, ErrorDetails, Result, Severity};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub service_name: String,
    /// Also write to a daily-rolling file under `log_dir`
    pub file_output: bool,
    pub log_dir: Option<String>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "fitness-api".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn,hyper=warn", config.level)));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
    });

    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true).with_thread_ids(true));

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (writer, guard) = NonBlocking::new(appender);
            // The guard flushes on drop; the file sink lives as long as the process
            Box::leak(Box::new(guard));
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| EngineError::Initialization(format!("Failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Logs a handled error at the level its severity calls for
pub fn log_error_details(error: &ErrorDetails) {
    let request_id = error.request_id.as_deref().unwrap_or("-");
    let correlation_id = error.correlation_id.as_deref().unwrap_or("-");

    match error.severity {
        Severity::Critical | Severity::High => error!(
            error_id = %error.id,
            code = %error.code,
            severity = %error.severity,
            category = %error.category,
            source = %error.source,
            request_id = %request_id,
            correlation_id = %correlation_id,
            stack = ?error.stack,
            "{}",
            error.message
        ),
        Severity::Medium => warn!(
            error_id = %error.id,
            code = %error.code,
            category = %error.category,
            source = %error.source,
            request_id = %request_id,
            correlation_id = %correlation_id,
            "{}",
            error.message
        ),
        Severity::Low => info!(
            error_id = %error.id,
            code = %error.code,
            category = %error.category,
            source = %error.source,
            "{}",
            error.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorContext;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json_format: false,
            ..Default::default()
        };

        assert!(init_logging(Some(config)).is_ok());
        assert!(init_logging(None).is_ok());
    }

    #[test]
    fn test_log_error_details_every_severity() {
        for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            let error = ErrorDetails::from_parts(
                "disk full".into(),
                ErrorContext::new().severity(severity).request_id("req-9"),
            );
            log_error_details(&error);
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: LoggingConfig = serde_json::from_str(r#"{ "level": "warn" }"#).unwrap();
        assert_eq!(config.level, "warn");
        assert!(config.json_format);
        assert!(!config.file_output);
    }
}
