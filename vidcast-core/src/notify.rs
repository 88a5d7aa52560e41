use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    VideoReady,
    VideoFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::VideoReady => write!(f, "video_ready"),
            NotificationKind::VideoFailed => write!(f, "video_failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
}

/// Fire-and-forget delivery to a user. Implementations must not block the
/// caller on delivery and have no way to report failure back.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, title: &str, body: &str, kind: NotificationKind);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, user_id: &str, title: &str, body: &str, kind: NotificationKind) {
        info!(target: "notify", user_id, %kind, title, body, "notification");
    }
}

/// POSTs each notification as JSON to a webhook from a detached task.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, user_id: &str, title: &str, body: &str, kind: NotificationKind) {
        let payload = Notification {
            user_id: user_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            kind,
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "notify", user_id, %kind, "no runtime available, notification dropped");
            return;
        };
        let client = self.http_client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            let result = client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            if let Err(err) = result {
                warn!(
                    target: "notify",
                    user_id = %payload.user_id,
                    kind = %payload.kind,
                    error = %err,
                    "webhook notification failed"
                );
            }
        });
    }
}

/// Chooses the webhook notifier when a URL is configured.
pub fn notifier_from_config(
    section: &crate::config::NotifySection,
) -> Result<std::sync::Arc<dyn Notifier>, reqwest::Error> {
    match section.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(std::sync::Arc::new(WebhookNotifier::new(url)?)),
        _ => Ok(std::sync::Arc::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifySection;

    #[test]
    fn notification_serialises_kind_in_snake_case() {
        let notification = Notification {
            user_id: "u1".into(),
            title: "Video ready".into(),
            body: "Your video is live".into(),
            kind: NotificationKind::VideoReady,
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["kind"], "video_ready");
    }

    #[tokio::test]
    async fn webhook_failure_never_reaches_caller() {
        // Nothing listens on port 9; delivery fails inside the spawned task.
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        notifier.notify("u1", "Video failed", "boom", NotificationKind::VideoFailed);
        tokio::task::yield_now().await;
    }

    #[test]
    fn notify_without_runtime_is_dropped() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        notifier.notify("u1", "Video ready", "ok", NotificationKind::VideoReady);
    }

    #[test]
    fn blank_webhook_falls_back_to_log() {
        let section = NotifySection {
            webhook_url: Some("  ".into()),
        };
        assert!(notifier_from_config(&section).is_ok());
    }
}
