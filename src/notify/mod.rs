//! Run-outcome notifications.
//!
//! The runner builds a [`Notification`] when a run warrants one and hands
//! it to a [`Notifier`]. The default [`LogNotifier`] writes to the log;
//! deployments wire in their own delivery.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::core::job::{Job, JobKind};
use crate::store::LogEntry;

/// Rendered for monitor failures when the job carries no template of its own.
pub const DEFAULT_MONITOR_ERROR_TEMPLATE: &str = "\
Monitor \"{{ name }}\" failed.

{{ stderr }}

URL: {{ url }}";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// A message about a finished run, addressed to the job's subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

/// Delivery backend for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            subject = %notification.subject,
            recipients = ?notification.recipients,
            "notification"
        );
        Ok(())
    }
}

/// Captures notifications for assertions in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }
}

/// Hook invoked after a failed run, outside the success/failure accounting.
#[async_trait]
pub trait ErrorCallback: Send + Sync {
    async fn on_error(&self, job: &Job, entry: &LogEntry) -> Result<(), NotifyError>;
}

/// Substitute `{{ key }}` placeholders. Unknown placeholders are left as-is.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{ {} }}}}", key), value);
    }
    out
}

/// Build the failure notification for a run, honoring monitor templates.
pub fn failure_notification(job: &Job, entry: &LogEntry) -> Notification {
    let body = match &job.kind {
        JobKind::Monitor {
            url,
            error_template,
            ..
        } => {
            let template = error_template
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_MONITOR_ERROR_TEMPLATE);
            render_template(
                template,
                &[
                    ("name", job.name.as_str()),
                    ("stderr", entry.stderr.as_str()),
                    ("url", url.as_deref().unwrap_or("")),
                ],
            )
        }
        JobKind::Recurring => format!(
            "Job \"{}\" failed on {}.\n\nstderr:\n{}",
            job.name, entry.hostname, entry.stderr
        ),
    };
    let kind = if job.kind.is_monitor() { "Monitor" } else { "Job" };
    Notification {
        subject: format!("{} failed: {}", kind, job.name),
        body,
        recipients: job.subscribers.clone(),
    }
}

/// Build the success notification for a run.
pub fn success_notification(job: &Job, entry: &LogEntry) -> Notification {
    Notification {
        subject: format!("Job succeeded: {}", job.name),
        body: format!(
            "Job \"{}\" completed in {}s on {}.\n\nstdout:\n{}",
            job.name, entry.duration_seconds, entry.hostname, entry.stdout
        ),
        recipients: job.subscribers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::CommandSpec;
    use crate::core::recurrence::Frequency;
    use crate::core::types::JobId;
    use chrono::{TimeZone, Utc};

    fn entry(job_id: JobId, stderr: &str, success: bool) -> LogEntry {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        LogEntry::new(
            job_id,
            start,
            start + chrono::Duration::seconds(5),
            "all good".into(),
            stderr.into(),
            success,
            true,
            "host-a".into(),
        )
    }

    #[test]
    fn test_render_template_substitutes_known_keys() {
        let out = render_template("{{ a }} and {{ b }} and {{ c }}", &[("a", "1"), ("b", "2")]);
        assert_eq!(out, "1 and 2 and {{ c }}");
    }

    #[test]
    fn test_failure_notification_for_recurring_job() {
        let job = Job::builder("backup", CommandSpec::Raw("false".into()), Frequency::Daily)
            .subscribers(vec!["ops@example.com".into()])
            .build();
        let n = failure_notification(&job, &entry(job.id, "disk full", false));
        assert_eq!(n.subject, "Job failed: backup");
        assert!(n.body.contains("disk full"));
        assert_eq!(n.recipients, vec!["ops@example.com"]);
    }

    #[test]
    fn test_monitor_failure_uses_custom_template() {
        let job = Job::builder(
            "site-check",
            CommandSpec::Raw("curl -fsS https://example.com".into()),
            Frequency::Minutely,
        )
        .monitor(
            Some("https://example.com".into()),
            Some("{{ name }} is down: {{ stderr }}".into()),
            None,
        )
        .build();
        let n = failure_notification(&job, &entry(job.id, "timeout", false));
        assert_eq!(n.subject, "Monitor failed: site-check");
        assert_eq!(n.body, "site-check is down: timeout");
    }

    #[test]
    fn test_monitor_failure_falls_back_to_default_template() {
        let job = Job::builder(
            "site-check",
            CommandSpec::Raw("curl -fsS https://example.com".into()),
            Frequency::Minutely,
        )
        .monitor(Some("https://example.com".into()), None, None)
        .build();
        let n = failure_notification(&job, &entry(job.id, "timeout", false));
        assert!(n.body.contains("Monitor \"site-check\" failed."));
        assert!(n.body.contains("URL: https://example.com"));
    }

    #[tokio::test]
    async fn test_recording_notifier_captures() {
        let recorder = RecordingNotifier::new();
        let n = Notification {
            subject: "s".into(),
            body: "b".into(),
            recipients: vec![],
        };
        recorder.send(&n).await.unwrap();
        assert_eq!(recorder.sent(), vec![n]);
    }
}
