//! Event reporting
//!
//! The engine calls an [`EventReporter`] when a run completes, fails, is
//! found corrupted or runs long. Reporters are fire-and-forget: a failing
//! reporter is logged and never changes the outcome of the operation.

use crate::config::{BackupKind, NotificationConfig, NotifyEvent, StorageProvider};
use crate::error::EngineError;
use crate::registry::BackupRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest error text placed in a webhook embed
const MAX_ERROR_CHARS: usize = 500;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BackupCompleted,
    BackupFailed,
    Corrupted,
    LongRunning,
    RestoreCompleted,
    RestoreFailed,
    RetentionSwept,
}

impl EventKind {
    /// Subscription class used by `notify_on`
    pub fn notify_event(&self) -> NotifyEvent {
        match self {
            EventKind::BackupCompleted => NotifyEvent::Success,
            EventKind::BackupFailed | EventKind::RestoreFailed => NotifyEvent::Failure,
            EventKind::Corrupted => NotifyEvent::Corrupted,
            EventKind::LongRunning => NotifyEvent::LongRunning,
            EventKind::RestoreCompleted => NotifyEvent::Restore,
            EventKind::RetentionSwept => NotifyEvent::Retention,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            EventKind::BackupCompleted => "Backup completed",
            EventKind::BackupFailed => "Backup failed",
            EventKind::Corrupted => "Backup corrupted",
            EventKind::LongRunning => "Backup running long",
            EventKind::RestoreCompleted => "Restore completed",
            EventKind::RestoreFailed => "Restore failed",
            EventKind::RetentionSwept => "Retention sweep",
        }
    }
}

/// One reportable event
#[derive(Debug, Clone)]
pub struct BackupEvent {
    pub kind: EventKind,
    pub job_name: String,
    pub backup_id: Option<String>,
    pub backup_kind: Option<BackupKind>,
    pub storage_provider: Option<StorageProvider>,
    pub message: String,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub duration_secs: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl BackupEvent {
    pub fn new(kind: EventKind, job_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            job_name: job_name.into(),
            backup_id: None,
            backup_kind: None,
            storage_provider: None,
            message: message.into(),
            error: None,
            error_kind: None,
            duration_secs: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_record(mut self, record: &BackupRecord) -> Self {
        self.backup_id = Some(record.id.clone());
        self.backup_kind = Some(record.kind);
        self.storage_provider = Some(record.storage_provider);
        self
    }

    pub fn with_error(mut self, err: &EngineError) -> Self {
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_secs = Some(duration.as_secs());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to send webhook: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook failed with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Callback receiving engine events
pub trait EventReporter: Send + Sync {
    fn report(&self, event: &BackupEvent) -> Result<(), NotifyError>;
}

/// Deliver `event`, logging instead of propagating any reporter failure
pub fn dispatch(reporter: &dyn EventReporter, event: &BackupEvent) {
    if let Err(e) = reporter.report(event) {
        warn!("Failed to report {:?} for '{}': {}", event.kind, event.job_name, e);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone)]
pub struct NoopReporter;

impl EventReporter for NoopReporter {
    fn report(&self, _event: &BackupEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogReporter;

impl EventReporter for LogReporter {
    fn report(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        let id = event.backup_id.as_deref().unwrap_or("-");
        match event.kind {
            EventKind::BackupFailed | EventKind::RestoreFailed | EventKind::Corrupted => error!(
                job = %event.job_name,
                backup_id = %id,
                error_kind = event.error_kind.unwrap_or("unknown"),
                "{}: {}",
                event.kind.title(),
                event.error.as_deref().unwrap_or(&event.message)
            ),
            EventKind::LongRunning => {
                warn!(job = %event.job_name, backup_id = %id, "{}", event.message)
            }
            _ => info!(job = %event.job_name, backup_id = %id, "{}", event.message),
        }
        Ok(())
    }
}

/// Sends every event to several reporters
#[derive(Clone, Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn EventReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn EventReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl EventReporter for FanoutReporter {
    fn report(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        for reporter in &self.reporters {
            dispatch(reporter.as_ref(), event);
        }
        Ok(())
    }
}

/// Discord embed color codes (decimal)
#[derive(Debug, Clone, Copy)]
pub enum NotificationColor {
    /// Red - for failures and corruption
    Failure = 15158332,
    /// Orange - for warnings
    Warning = 15105570,
    /// Yellow - for long-running operations
    LongRunning = 16776960,
    /// Green - for success
    Success = 3066993,
    /// Blue - for info
    Info = 3447003,
}

impl NotificationColor {
    fn as_decimal(&self) -> u32 {
        *self as u32
    }

    fn for_event(kind: EventKind) -> Self {
        match kind {
            EventKind::BackupFailed | EventKind::RestoreFailed => NotificationColor::Failure,
            EventKind::Corrupted => NotificationColor::Warning,
            EventKind::LongRunning => NotificationColor::LongRunning,
            EventKind::BackupCompleted | EventKind::RestoreCompleted => NotificationColor::Success,
            EventKind::RetentionSwept => NotificationColor::Info,
        }
    }
}

/// Discord webhook payload
#[derive(Debug, Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<DiscordFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

/// Posts Discord-compatible embeds to a webhook.
///
/// Only events listed in `notify_on` are sent, and the same event for the
/// same job is sent at most once per `rate_limit_minutes`.
pub struct WebhookReporter {
    config: NotificationConfig,
    client: reqwest::blocking::Client,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl WebhookReporter {
    pub fn new(config: NotificationConfig) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            client,
            last_sent: Mutex::new(HashMap::new()),
        })
    }

    /// Check if notifications are enabled for an event type
    pub fn is_enabled(&self, event: NotifyEvent) -> bool {
        !self.config.webhook_url.is_empty() && self.config.notify_on.contains(&event)
    }

    /// Claim the send slot for `key`; false while it is rate-limited
    fn claim(&self, key: &str) -> bool {
        let window = Duration::from_secs(self.config.rate_limit_minutes * 60);
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        if let Some(previous) = last_sent.get(key) {
            if now.duration_since(*previous) < window {
                return false;
            }
        }
        last_sent.insert(key.to_string(), now);
        true
    }

    fn build_payload(&self, event: &BackupEvent) -> DiscordPayload {
        let color = NotificationColor::for_event(event.kind);

        let mut fields = vec![DiscordField {
            name: "Job".to_string(),
            value: event.job_name.clone(),
            inline: true,
        }];

        if let Some(ref id) = event.backup_id {
            fields.push(DiscordField {
                name: "Backup".to_string(),
                value: id.clone(),
                inline: true,
            });
        }

        if let Some(provider) = event.storage_provider {
            fields.push(DiscordField {
                name: "Storage".to_string(),
                value: provider.to_string(),
                inline: true,
            });
        }

        if let Some(duration) = event.duration_secs {
            fields.push(DiscordField {
                name: "Duration".to_string(),
                value: format_duration(duration),
                inline: true,
            });
        }

        if let Some(ref error) = event.error {
            fields.push(DiscordField {
                name: "Error".to_string(),
                value: format!("```\n{}\n```", truncate(error, MAX_ERROR_CHARS)),
                inline: false,
            });
        }

        let embed = DiscordEmbed {
            title: event.kind.title().to_string(),
            description: Some(event.message.clone()),
            color: color.as_decimal(),
            fields,
            footer: Some(DiscordFooter {
                text: "backup-engine".to_string(),
            }),
            timestamp: Some(event.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        };

        DiscordPayload {
            username: Some("Backup Engine".to_string()),
            embeds: vec![embed],
        }
    }

    fn send_webhook(&self, payload: &DiscordPayload) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(payload)
            .send()?;

        let status = response.status();
        if status.is_success() {
            debug!("Webhook sent successfully");
            Ok(())
        } else {
            let body = response.text().unwrap_or_default();
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

impl EventReporter for WebhookReporter {
    fn report(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        let class = event.kind.notify_event();
        if !self.is_enabled(class) {
            debug!("Notification type {:?} not enabled, skipping", class);
            return Ok(());
        }

        let key = format!("{}:{:?}", event.job_name, event.kind);
        if !self.claim(&key) {
            debug!("Notification rate-limited for key: {}", key);
            return Ok(());
        }

        self.send_webhook(&self.build_payload(event))?;
        info!("Sent {:?} notification for job '{}'", event.kind, event.job_name);
        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Format duration in human-readable form
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        let minutes = seconds / 60;
        let secs = seconds % 60;
        if secs == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, secs)
        }
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        if minutes == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    }
}
