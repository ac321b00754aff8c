use std::future::Future;
use std::path::Path;
use std::time::Duration;

use homecam_common::event::Notification;
use reqwest::multipart::{Form, Part};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: String,
        source: std::io::Error,
    },
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned HTTP {0}")]
    Status(reqwest::StatusCode),
}

/// Somewhere notifications go. Sinks only read attachments; the dispatcher
/// removes them afterwards.
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

pub fn kind(notification: &Notification) -> &'static str {
    match notification {
        Notification::Motion { .. } => "motion",
        Notification::HealthDegraded { .. } => "health",
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Posts each notification as `multipart/form-data` with `kind`, `text`
/// and, when present, the clip or photo as `file`.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl NotificationSink for WebhookSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut form = Form::new()
            .text("kind", kind(notification))
            .text("text", notification.text().to_string());

        if let Some(path) = notification.attachment() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| NotifyError::Attachment {
                    path: path.display().to_string(),
                    source,
                })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".into());
            let size = bytes.len();
            let part = Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime_for(path))?;
            form = form.part("file", part);
            debug!(bytes = size, "attaching file to webhook");
        }

        let response = self.client.post(&self.url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogSink;

impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            kind = kind(notification),
            attachment = notification.attachment().map(|p| p.display().to_string()),
            "{}",
            notification.text()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Remove a notification's attached file, if any.
pub fn discard_attachment(notification: &Notification) {
    let Some(path) = notification.attachment() else {
        return;
    };
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed delivered attachment"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove attachment"),
    }
}

/// Deliver every event until all senders are gone. Attachments are removed
/// whether or not delivery succeeded.
pub async fn run_dispatcher<N: NotificationSink>(sink: N, mut events: mpsc::Receiver<Notification>) {
    info!(sink = sink.name(), "notification dispatcher started");
    while let Some(notification) = events.recv().await {
        match sink.deliver(&notification).await {
            Ok(()) => debug!(sink = sink.name(), kind = kind(&notification), "notification delivered"),
            Err(e) => warn!(
                sink = sink.name(),
                kind = kind(&notification),
                error = %e,
                "failed to deliver notification"
            ),
        }
        discard_attachment(&notification);
    }
    info!("notification channel closed, dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        seen: Arc<Mutex<Vec<(String, bool)>>>,
        fail: bool,
    }

    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
            let attachment_present = notification.attachment().is_some_and(|p| p.exists());
            self.seen
                .lock()
                .unwrap()
                .push((notification.text().to_string(), attachment_present));
            if self.fail {
                Err(NotifyError::Status(reqwest::StatusCode::BAD_GATEWAY))
            } else {
                Ok(())
            }
        }
    }

    fn motion_with_file(dir: &Path) -> (Notification, PathBuf) {
        let path = dir.join("clip.mp4");
        std::fs::write(&path, b"mp4").unwrap();
        let notification = Notification::Motion {
            clip: Some(path.clone()),
            caption: "Motion detected!".into(),
        };
        (notification, path)
    }

    #[tokio::test]
    async fn attachments_are_removed_after_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let (notification, path) = motion_with_file(dir.path());
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::channel(4);

        tx.send(notification).await.unwrap();
        tx.send(Notification::HealthDegraded {
            message: "camera down".into(),
        })
        .await
        .unwrap();
        drop(tx);
        run_dispatcher(sink.clone(), rx).await;

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![("Motion detected!".to_string(), true), ("camera down".to_string(), false)]
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn attachments_are_removed_when_delivery_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (notification, path) = motion_with_file(dir.path());
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(1);
        tx.send(notification).await.unwrap();
        drop(tx);

        run_dispatcher(sink, rx).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn log_sink_accepts_everything() {
        let caption_only = Notification::Motion {
            clip: None,
            caption: "Motion detected!".into(),
        };
        assert!(LogSink.deliver(&caption_only).await.is_ok());
    }

    #[test]
    fn attachment_mime_types() {
        assert_eq!(mime_for(Path::new("a/clip.mp4")), "video/mp4");
        assert_eq!(mime_for(Path::new("snapshot.jpg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }
}
