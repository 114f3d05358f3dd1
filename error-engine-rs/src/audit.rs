//! Audit trail hook for security-relevant errors

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::types::{ErrorCategory, ErrorDetails, Severity};

pub const ERROR_OCCURRED: &str = "ERROR_OCCURRED";

/// Sink for audit events, usually the audit-logging service
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log_event(&self, user_id: &str, action: &str, resource: &str, details: Value) -> anyhow::Result<()>;
}

/// Writes audit events to the `audit` tracing target
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log_event(&self, user_id: &str, action: &str, resource: &str, details: Value) -> anyhow::Result<()> {
        info!(target: "audit", user_id, action, resource, details = %details, "Audit event");
        Ok(())
    }
}

/// Errors that leave an audit record: attributable to a user and either
/// security related or critical
pub fn requires_audit(error: &ErrorDetails) -> bool {
    error.user_id.is_some()
        && (matches!(
            error.category,
            ErrorCategory::Security | ErrorCategory::Authentication | ErrorCategory::Authorization
        ) || error.severity == Severity::Critical)
}

pub fn audit_details(error: &ErrorDetails) -> Value {
    json!({
        "errorId": error.id,
        "code": error.code,
        "severity": error.severity,
        "category": error.category,
        "requestId": error.request_id,
        "correlationId": error.correlation_id,
    })
}
