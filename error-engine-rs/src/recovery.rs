//! # Automatic Recovery
//!
//! Category-specific recovery strategies run inside a shared retry loop
//! guarded by per-`category:source` circuit breakers. Strategy selection is
//! a typed dispatch on [`ErrorCategory`]; the side effects themselves are
//! delegated to a [`RecoveryActions`] implementation so deployments and
//! tests can plug in their own.
//!
//! Recovery never fails loudly: the outcome is recorded on the error record
//! (`recovery_attempted`, `recovery_successful`) and returned as a boolean.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::persistence::ErrorStore;
use crate::retry::RetryPolicy;
use crate::types::{ErrorCategory, ErrorDetails};

/// Recovery settings for one error category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryStrategyConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RecoveryStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Recovery settings applied when none are configured explicitly
pub fn default_recovery_configs() -> HashMap<ErrorCategory, RecoveryStrategyConfig> {
    let mut configs = HashMap::new();

    configs.insert(ErrorCategory::Database, RecoveryStrategyConfig::default());
    configs.insert(
        ErrorCategory::Network,
        RecoveryStrategyConfig {
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            circuit_breaker: CircuitBreakerConfig {
                reset_timeout_ms: 30_000,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    configs.insert(
        ErrorCategory::Integration,
        RecoveryStrategyConfig {
            max_attempts: 2,
            max_delay_ms: 5_000,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    configs.insert(
        ErrorCategory::Authentication,
        RecoveryStrategyConfig {
            max_attempts: 1,
            ..Default::default()
        },
    );
    configs.insert(
        ErrorCategory::Authorization,
        RecoveryStrategyConfig {
            max_attempts: 1,
            ..Default::default()
        },
    );
    configs.insert(
        ErrorCategory::Validation,
        RecoveryStrategyConfig {
            enabled: false,
            max_attempts: 1,
            ..Default::default()
        },
    );

    configs
}

/// The recovery strategy chosen for a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    VerifyConnectivity,
    RetryOperation,
    SanitizeAndRetry,
    RefreshToken,
    ReverifyPermissions,
    FallbackService,
    LogAndAcknowledge,
}

impl RecoveryStrategy {
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Database => RecoveryStrategy::VerifyConnectivity,
            ErrorCategory::Network => RecoveryStrategy::RetryOperation,
            ErrorCategory::Validation => RecoveryStrategy::SanitizeAndRetry,
            ErrorCategory::Authentication => RecoveryStrategy::RefreshToken,
            ErrorCategory::Authorization => RecoveryStrategy::ReverifyPermissions,
            ErrorCategory::Integration => RecoveryStrategy::FallbackService,
            ErrorCategory::Performance
            | ErrorCategory::Security
            | ErrorCategory::System
            | ErrorCategory::Business => RecoveryStrategy::LogAndAcknowledge,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::VerifyConnectivity => "verify_connectivity",
            RecoveryStrategy::RetryOperation => "retry_operation",
            RecoveryStrategy::SanitizeAndRetry => "sanitize_and_retry",
            RecoveryStrategy::RefreshToken => "refresh_token",
            RecoveryStrategy::ReverifyPermissions => "reverify_permissions",
            RecoveryStrategy::FallbackService => "fallback_service",
            RecoveryStrategy::LogAndAcknowledge => "log_and_acknowledge",
        }
    }
}

/// Side effects performed by the recovery strategies.
///
/// Each method returns `Ok(true)` when the failure is considered recovered.
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    async fn verify_connectivity(&self, error: &ErrorDetails) -> anyhow::Result<bool>;

    async fn retry_operation(&self, error: &ErrorDetails) -> anyhow::Result<bool>;

    async fn sanitize_and_retry(&self, error: &ErrorDetails) -> anyhow::Result<bool>;

    async fn refresh_token(&self, error: &ErrorDetails) -> anyhow::Result<bool>;

    async fn reverify_permissions(&self, error: &ErrorDetails) -> anyhow::Result<bool>;

    async fn fallback_service(&self, error: &ErrorDetails) -> anyhow::Result<bool>;
}

/// Built-in actions used when the deployment supplies none
pub struct DefaultRecoveryActions {
    store: Option<Arc<dyn ErrorStore>>,
}

impl DefaultRecoveryActions {
    pub fn new(store: Option<Arc<dyn ErrorStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryActions for DefaultRecoveryActions {
    /// Pings the relational store
    async fn verify_connectivity(&self, _error: &ErrorDetails) -> anyhow::Result<bool> {
        match &self.store {
            Some(store) => {
                store.ping().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Acknowledges the failure so the caller's own retry may proceed
    async fn retry_operation(&self, _error: &ErrorDetails) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Succeeds when a (sanitized) request payload is available to replay
    async fn sanitize_and_retry(&self, error: &ErrorDetails) -> anyhow::Result<bool> {
        Ok(error.context.contains_key("request") || error.context.contains_key("input"))
    }

    async fn refresh_token(&self, error: &ErrorDetails) -> anyhow::Result<bool> {
        debug!(user_id = ?error.user_id, "No token service configured, refresh skipped");
        Ok(false)
    }

    async fn reverify_permissions(&self, error: &ErrorDetails) -> anyhow::Result<bool> {
        debug!(user_id = ?error.user_id, "No permission service configured, reverification skipped");
        Ok(false)
    }

    /// Succeeds when the caller registered a fallback for the integration
    async fn fallback_service(&self, error: &ErrorDetails) -> anyhow::Result<bool> {
        Ok(error.context.contains_key("fallback"))
    }
}

struct CategoryRecovery {
    config: RecoveryStrategyConfig,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

pub struct RecoveryEngine {
    categories: HashMap<ErrorCategory, CategoryRecovery>,
    actions: Arc<dyn RecoveryActions>,
}

impl RecoveryEngine {
    pub fn new(
        configs: &HashMap<ErrorCategory, RecoveryStrategyConfig>,
        actions: Arc<dyn RecoveryActions>,
    ) -> Self {
        let categories = configs
            .iter()
            .map(|(category, config)| {
                let name = format!("recovery.{}", category);
                let policy = RetryPolicy::new(
                    name.clone(),
                    config.max_attempts,
                    Duration::from_millis(config.base_delay_ms),
                    Duration::from_millis(config.max_delay_ms),
                );
                let breaker = CircuitBreaker::new(name, config.circuit_breaker.clone());
                (
                    *category,
                    CategoryRecovery {
                        config: config.clone(),
                        policy,
                        breaker,
                    },
                )
            })
            .collect();

        Self { categories, actions }
    }

    /// Attempts to recover from the error, recording the outcome on it.
    ///
    /// Returns false without attempting anything when the category has no
    /// enabled recovery configuration.
    pub async fn attempt_recovery(&self, error: &mut ErrorDetails) -> bool {
        let recovery = match self.categories.get(&error.category) {
            Some(recovery) if recovery.config.enabled => recovery,
            _ => return false,
        };

        let strategy = RecoveryStrategy::for_category(error.category);
        let key = error.rate_limit_key();
        error.recovery_attempted = true;

        let outcome = {
            let snapshot: &ErrorDetails = error;
            recovery
                .policy
                .run(Some(&recovery.breaker), &key, |_| self.execute(strategy, snapshot))
                .await
        };

        error.recovery_successful = outcome.succeeded;
        error.set_context("recoveryStrategy", strategy.as_str());
        error.set_context("recoveryAttempts", outcome.attempts);

        if outcome.succeeded {
            info!(
                code = %error.code,
                circuit = %key,
                strategy = %strategy.as_str(),
                attempts = %outcome.attempts,
                "Recovery succeeded"
            );
        } else {
            warn!(
                code = %error.code,
                circuit = %key,
                strategy = %strategy.as_str(),
                attempts = %outcome.attempts,
                short_circuited = %outcome.short_circuited,
                "Recovery failed"
            );
        }

        outcome.succeeded
    }

    async fn execute(&self, strategy: RecoveryStrategy, error: &ErrorDetails) -> anyhow::Result<bool> {
        match strategy {
            RecoveryStrategy::VerifyConnectivity => self.actions.verify_connectivity(error).await,
            RecoveryStrategy::RetryOperation => self.actions.retry_operation(error).await,
            RecoveryStrategy::SanitizeAndRetry => self.actions.sanitize_and_retry(error).await,
            RecoveryStrategy::RefreshToken => self.actions.refresh_token(error).await,
            RecoveryStrategy::ReverifyPermissions => self.actions.reverify_permissions(error).await,
            RecoveryStrategy::FallbackService => self.actions.fallback_service(error).await,
            RecoveryStrategy::LogAndAcknowledge => {
                info!(
                    code = %error.code,
                    category = %error.category,
                    source = %error.source,
                    "Error acknowledged without automatic recovery"
                );
                Ok(true)
            }
        }
    }

    /// Current circuit state for a `category:source` pair
    pub fn circuit_state(&self, category: ErrorCategory, source: &str) -> CircuitState {
        self.categories
            .get(&category)
            .map_or(CircuitState::Closed, |recovery| {
                recovery.breaker.state(&format!("{}:{}", category, source))
            })
    }

    /// Forgets idle closed circuits across all categories
    pub fn sweep(&self) -> usize {
        self.categories.values().map(|recovery| recovery.breaker.sweep()).sum()
    }
}
