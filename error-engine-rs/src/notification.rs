//! Severity-routed notification fan-out
//!
//! Channels are tagged; the severity of an error decides which tags it may
//! reach. Every channel is sent to independently and concurrently, and one
//! failing channel never blocks or fails the others.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::monitoring::{EngineStats, PipelineEvent};
use crate::sanitization::sanitize_message;
use crate::types::{ErrorDetails, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelTag {
    Log,
    LowPriority,
    Standard,
    Email,
    Chat,
    Webhook,
    Pager,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    pub tags: Vec<ChannelTag>,
}

impl NotificationChannel {
    pub fn new<S: Into<String>>(name: S, tags: &[ChannelTag]) -> Self {
        Self {
            name: name.into(),
            tags: tags.to_vec(),
        }
    }

    pub fn has_tag(&self, tag: ChannelTag) -> bool {
        self.tags.contains(&tag)
    }

    /// Whether an error of this severity may be sent here
    pub fn accepts(&self, severity: Severity) -> bool {
        match severity {
            Severity::Critical => true,
            Severity::High => !self.has_tag(ChannelTag::LowPriority),
            Severity::Medium => self.has_tag(ChannelTag::Standard) || self.has_tag(ChannelTag::Email),
            Severity::Low => self.has_tag(ChannelTag::Log) || self.has_tag(ChannelTag::LowPriority),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channels: Vec<NotificationChannel>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                NotificationChannel::new("log", &[ChannelTag::Log, ChannelTag::LowPriority]),
                NotificationChannel::new("email", &[ChannelTag::Email, ChannelTag::Standard]),
                NotificationChannel::new("slack", &[ChannelTag::Chat, ChannelTag::Standard]),
                NotificationChannel::new("pagerduty", &[ChannelTag::Pager]),
            ],
        }
    }
}

/// A rendered message for one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub error_id: Uuid,
    pub severity: Severity,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Renders the error as admitted; notifications go out before recovery settles
    pub fn from_error(error: &ErrorDetails) -> Self {
        let subject = format!(
            "[{}] {} error in {}",
            error.severity, error.category, error.source
        );

        let mut body = format!("{} (Code: {})", sanitize_message(&error.message), error.code);
        if let Some(request_id) = &error.request_id {
            body.push_str(&format!("\nRequest: {}", request_id));
        }
        if let Some(correlation_id) = &error.correlation_id {
            body.push_str(&format!("\nCorrelation: {}", correlation_id));
        }

        Self {
            error_id: error.id,
            severity: error.severity,
            subject,
            body,
        }
    }
}

/// Transport for one kind of channel
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, channel: &NotificationChannel, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log instead of an external transport
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, channel: &NotificationChannel, notification: &Notification) -> anyhow::Result<()> {
        match notification.severity {
            Severity::Critical | Severity::High => warn!(
                channel = %channel.name,
                error_id = %notification.error_id,
                subject = %notification.subject,
                "{}",
                notification.body
            ),
            Severity::Medium | Severity::Low => info!(
                channel = %channel.name,
                error_id = %notification.error_id,
                subject = %notification.subject,
                "{}",
                notification.body
            ),
        }
        Ok(())
    }
}

/// Which channels a notification reached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

pub struct NotificationDispatcher {
    channels: Vec<NotificationChannel>,
    default_sender: Arc<dyn NotificationSender>,
    senders: HashMap<String, Arc<dyn NotificationSender>>,
    stats: Arc<EngineStats>,
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig, default_sender: Arc<dyn NotificationSender>, stats: Arc<EngineStats>) -> Self {
        Self {
            channels: config.channels,
            default_sender,
            senders: HashMap::new(),
            stats,
        }
    }

    /// Routes one channel through a dedicated transport
    pub fn with_sender<S: Into<String>>(mut self, channel: S, sender: Arc<dyn NotificationSender>) -> Self {
        self.senders.insert(channel.into(), sender);
        self
    }

    pub fn channels_for(&self, severity: Severity) -> Vec<&NotificationChannel> {
        self.channels
            .iter()
            .filter(|channel| channel.accepts(severity))
            .collect()
    }

    pub async fn notify(&self, error: &ErrorDetails) -> DispatchReport {
        let notification = Notification::from_error(error);
        let targets = self.channels_for(error.severity);

        let sends = targets.into_iter().map(|channel| {
            let sender = self
                .senders
                .get(&channel.name)
                .unwrap_or(&self.default_sender)
                .clone();
            let notification = &notification;
            async move {
                let result = match AssertUnwindSafe(sender.send(channel, notification)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("sender panicked")),
                };
                (channel.name.clone(), result)
            }
        });

        let mut report = DispatchReport::default();
        for (channel, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(channel),
                Err(e) => {
                    error!(channel = %channel, error_id = %error.id, error = %e, "Notification channel failed");
                    self.stats.record(PipelineEvent::NotificationFailed);
                    report.failed.push(channel);
                }
            }
        }

        report
    }
}
