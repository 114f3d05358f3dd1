//! # Probabilistic Sampling
//!
//! Admits a fraction of errors for full processing. The rate is resolved
//! from the most specific setting available: severity, then category, then
//! the global default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ErrorCategory, ErrorDetails, Severity};

/// Configuration for error sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Rate used when neither severity nor category has one (0.0 to 1.0)
    pub default_rate: f64,
    pub severity_rates: HashMap<Severity, f64>,
    pub category_rates: HashMap<ErrorCategory, f64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        let mut severity_rates = HashMap::new();
        severity_rates.insert(Severity::Critical, 1.0);
        severity_rates.insert(Severity::High, 1.0);

        Self {
            default_rate: 1.0,
            severity_rates,
            category_rates: HashMap::new(),
        }
    }
}

/// Point-in-time sampler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerStats {
    pub sampled: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    sampled: AtomicU64,
    dropped: AtomicU64,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            config,
            sampled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Resolves the admission rate for an error
    pub fn rate_for(&self, error: &ErrorDetails) -> f64 {
        self.config
            .severity_rates
            .get(&error.severity)
            .or_else(|| self.config.category_rates.get(&error.category))
            .copied()
            .unwrap_or(self.config.default_rate)
    }

    pub fn should_process(&self, error: &ErrorDetails) -> bool {
        let draw: f64 = rand::thread_rng().gen();
        self.decide(error, draw)
    }

    /// Admission decision for a given uniform draw in `[0, 1)`
    fn decide(&self, error: &ErrorDetails, draw: f64) -> bool {
        let rate = self.rate_for(error);
        let admitted = draw < rate;

        if admitted {
            self.sampled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                code = %error.code,
                severity = %error.severity,
                category = %error.category,
                rate = %rate,
                "Error dropped by sampler"
            );
        }

        admitted
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            sampled: self.sampled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorContext;

    fn error(severity: Severity, category: ErrorCategory) -> ErrorDetails {
        ErrorDetails::from_parts(
            "sampled".into(),
            ErrorContext::new().severity(severity).category(category),
        )
    }

    fn sampler() -> Sampler {
        let mut severity_rates = HashMap::new();
        severity_rates.insert(Severity::Critical, 1.0);
        let mut category_rates = HashMap::new();
        category_rates.insert(ErrorCategory::Validation, 0.1);
        Sampler::new(SamplingConfig {
            default_rate: 0.5,
            severity_rates,
            category_rates,
        })
    }

    #[test]
    fn test_rate_resolution_order() {
        let sampler = sampler();

        // Severity beats category
        assert_eq!(sampler.rate_for(&error(Severity::Critical, ErrorCategory::Validation)), 1.0);
        assert_eq!(sampler.rate_for(&error(Severity::Low, ErrorCategory::Validation)), 0.1);
        assert_eq!(sampler.rate_for(&error(Severity::Low, ErrorCategory::Network)), 0.5);
    }

    #[test]
    fn test_decision_compares_draw_to_rate() {
        let sampler = sampler();
        let err = error(Severity::Low, ErrorCategory::Network);

        assert!(sampler.decide(&err, 0.49));
        assert!(!sampler.decide(&err, 0.5));
        assert!(!sampler.decide(&err, 0.99));

        assert_eq!(sampler.stats(), SamplerStats { sampled: 1, dropped: 2 });
    }

    #[test]
    fn test_extreme_rates() {
        let mut config = SamplingConfig::default();
        config.default_rate = 0.0;
        config.severity_rates.clear();
        let never = Sampler::new(config);
        let always = Sampler::new(SamplingConfig::default());
        let err = error(Severity::Medium, ErrorCategory::Business);

        for _ in 0..50 {
            assert!(!never.should_process(&err));
            assert!(always.should_process(&err));
        }
    }
}
