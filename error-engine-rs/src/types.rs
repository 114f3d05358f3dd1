//! # Error Records and Engine Errors
//!
//! This module defines the record every failure is funneled through
//! ([`ErrorDetails`]), its taxonomy ([`Severity`] × [`ErrorCategory`]), the
//! caller-facing inputs ([`ErrorInput`], [`ErrorContext`]) and the engine's
//! own internal error type ([`EngineError`]).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to [`EngineError`]
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failures raised inside the engine itself.
///
/// These never escape `handle_error`; every stage catches, logs and counts
/// its own failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notification failed on channel {channel}: {reason}")]
    Notification { channel: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// The severity level of a handled error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "LOW", alias = "low")]
    Low,
    #[serde(rename = "MEDIUM", alias = "medium")]
    Medium,
    #[serde(rename = "HIGH", alias = "high")]
    High,
    #[serde(rename = "CRITICAL", alias = "critical")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

/// The domain a handled error belongs to.
///
/// Category drives recovery strategy selection, sampling and rate-limit
/// budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Rejected input
    Validation,
    /// Identity could not be established
    Authentication,
    /// Identity established but access denied
    Authorization,
    /// Relational store failures
    Database,
    /// Transport level failures
    Network,
    /// Third-party service failures
    Integration,
    /// Slow operations and resource pressure
    Performance,
    /// Suspicious or hostile activity
    Security,
    /// Process and runtime failures
    System,
    /// Domain rule violations
    Business,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::Validation,
        ErrorCategory::Authentication,
        ErrorCategory::Authorization,
        ErrorCategory::Database,
        ErrorCategory::Network,
        ErrorCategory::Integration,
        ErrorCategory::Performance,
        ErrorCategory::Security,
        ErrorCategory::System,
        ErrorCategory::Business,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Database => "database",
            ErrorCategory::Network => "network",
            ErrorCategory::Integration => "integration",
            ErrorCategory::Performance => "performance",
            ErrorCategory::Security => "security",
            ErrorCategory::System => "system",
            ErrorCategory::Business => "business",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ErrorCategory {
    fn default() -> Self {
        ErrorCategory::System
    }
}

pub const DEFAULT_CODE: &str = "UNKNOWN_ERROR";
pub const DEFAULT_SOURCE: &str = "unknown";

/// A single failure as it travels through the pipeline.
///
/// Created once per failure, mutated in place by enrichment and recovery,
/// and treated as immutable once queued for persistence or reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Unique identifier of this occurrence
    pub id: Uuid,
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub severity: Severity,
    pub category: ErrorCategory,
    /// Component that raised the error, e.g. `workouts-service`
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub retry_count: u32,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorDetails {
    /// Creates a record with default classification for the given message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self::from_parts(ErrorInput::from(message.into()), ErrorContext::default())
    }

    /// Builds a record from the raw failure and the caller's partial details
    pub fn from_parts(input: ErrorInput, context: ErrorContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: input.message,
            code: context.code.unwrap_or_else(|| DEFAULT_CODE.to_string()),
            stack: context.stack.or(input.stack),
            severity: context.severity.unwrap_or_default(),
            category: context.category.unwrap_or_default(),
            source: context.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            user_id: context.user_id,
            request_id: context.request_id,
            correlation_id: context.correlation_id,
            retry_count: context.retry_count.unwrap_or(0),
            recovery_attempted: false,
            recovery_successful: false,
            context: context.fields,
            timestamp: Utc::now(),
        }
    }

    /// Key used by rate limiting and circuit breaking: `category:source`
    pub fn rate_limit_key(&self) -> String {
        format!("{}:{}", self.category, self.source)
    }

    /// Key used by the duplicate cache: `category:code:source`
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.category, self.code, self.source)
    }

    /// Key used by aggregation: `category:code`
    pub fn aggregation_key(&self) -> String {
        format!("{}:{}", self.category, self.code)
    }

    /// Looks up a named field, first in the free-form context and then
    /// among the record's identifying fields.
    pub fn lookup_field(&self, name: &str) -> Option<String> {
        if let Some(value) = self.context.get(name) {
            return match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
        }

        match name {
            "correlationId" | "correlation_id" => self.correlation_id.clone(),
            "requestId" | "request_id" => self.request_id.clone(),
            "userId" | "user_id" => self.user_id.clone(),
            "source" => Some(self.source.clone()),
            "code" => Some(self.code.clone()),
            _ => None,
        }
    }

    /// Adds a context field, replacing any previous value
    pub fn set_context<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} error in {}: {} (Code: {})",
            self.severity, self.category, self.source, self.message, self.code
        )?;

        if let Some(correlation_id) = &self.correlation_id {
            write!(f, " [CorrelationID: {}]", correlation_id)?;
        }

        Ok(())
    }
}

/// The raw failure handed to the engine: either a message or an error value
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInput {
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorInput {
    /// Captures the message and the `source()` chain of an error value
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: if causes.is_empty() { None } else { Some(causes.join("\n")) },
        }
    }
}

impl From<&str> for ErrorInput {
    fn from(message: &str) -> Self {
        Self { message: message.to_string(), stack: None }
    }
}

impl From<String> for ErrorInput {
    fn from(message: String) -> Self {
        Self { message, stack: None }
    }
}

impl From<&EngineError> for ErrorInput {
    fn from(err: &EngineError) -> Self {
        Self::from_error(err)
    }
}

impl From<&(dyn std::error::Error + 'static)> for ErrorInput {
    fn from(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::from_error(err)
    }
}

impl From<&(dyn std::error::Error + Send + Sync + 'static)> for ErrorInput {
    fn from(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Self {
        Self::from_error(err)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ErrorInput {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::from_error(err.as_ref())
    }
}

impl From<&anyhow::Error> for ErrorInput {
    fn from(err: &anyhow::Error) -> Self {
        Self::from_error(AsRef::<dyn std::error::Error + Send + Sync>::as_ref(err))
    }
}

impl From<anyhow::Error> for ErrorInput {
    fn from(err: anyhow::Error) -> Self {
        Self::from(&err)
    }
}

/// Partial details supplied by the caller alongside a failure.
///
/// Any field left unset falls back to the engine defaults
/// (`UNKNOWN_ERROR`, MEDIUM, SYSTEM, `unknown`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub code: Option<String>,
    pub stack: Option<String>,
    pub severity: Option<Severity>,
    pub category: Option<ErrorCategory>,
    pub source: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub retry_count: Option<u32>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Adds a free-form context field
    pub fn field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.fields.insert(key.into(), value);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let err = ErrorDetails::new("boom");

        assert_eq!(err.code, DEFAULT_CODE);
        assert_eq!(err.source, DEFAULT_SOURCE);
        assert_eq!(err.severity, Severity::Medium);
        assert_eq!(err.category, ErrorCategory::System);
        assert!(!err.recovery_attempted);
    }

    #[test]
    fn test_grouping_keys() {
        let err = ErrorDetails::from_parts(
            "connection refused".into(),
            ErrorContext::new()
                .code("DB_CONN")
                .category(ErrorCategory::Database)
                .source("workouts-service"),
        );

        assert_eq!(err.rate_limit_key(), "database:workouts-service");
        assert_eq!(err.cache_key(), "database:DB_CONN:workouts-service");
        assert_eq!(err.aggregation_key(), "database:DB_CONN");
    }

    #[test]
    fn test_lookup_field_prefers_context() {
        let err = ErrorDetails::from_parts(
            "timeout".into(),
            ErrorContext::new()
                .correlation_id("corr-top")
                .request_id("req-1")
                .field("sessionId", "sess-9")
                .field("attempt", 3),
        );

        assert_eq!(err.lookup_field("sessionId"), Some("sess-9".to_string()));
        assert_eq!(err.lookup_field("attempt"), Some("3".to_string()));
        assert_eq!(err.lookup_field("correlationId"), Some("corr-top".to_string()));
        assert_eq!(err.lookup_field("requestId"), Some("req-1".to_string()));
        assert_eq!(err.lookup_field("userId"), None);
    }

    #[test]
    fn test_input_from_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let outer = EngineError::Io(inner);
        let input = ErrorInput::from(&outer);

        assert!(input.message.contains("reset by peer"));
    }

    #[test]
    fn test_input_from_arbitrary_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(io);
        assert_eq!(ErrorInput::from(boxed).message, "upstream timed out");

        let parse = "abc".parse::<u32>().unwrap_err();
        let dynamic: &(dyn std::error::Error + 'static) = &parse;
        assert_eq!(ErrorInput::from(dynamic).message, parse.to_string());

        let wrapped = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            .context("failed to write workout");
        let input = ErrorInput::from(wrapped);
        assert_eq!(input.message, "failed to write workout");
        assert_eq!(input.stack.as_deref(), Some("caused by: disk full"));
    }

    #[test]
    fn test_serialized_shape() {
        let err = ErrorDetails::from_parts(
            "bad payload".into(),
            ErrorContext::new().severity(Severity::High).category(ErrorCategory::Validation),
        );
        let json = serde_json::to_value(&err).unwrap();

        assert_eq!(json["severity"], "HIGH");
        assert_eq!(json["category"], "validation");
        assert_eq!(json["retryCount"], 0);
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_severity_accepts_lowercase() {
        let sev: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(sev, Severity::Critical);
    }
}
