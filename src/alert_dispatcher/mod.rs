//! AlertDispatcher - Outbound incident alerts
//!
//! ## Responsibilities
//!
//! - `AlertSink` seam for incident notifications
//! - Webhook sink: multipart POST with a `payload_json` text part and the
//!   captured frame as `media`
//! - Recording sink for tests

use crate::models::IncidentClass;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

/// Alert content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentAlert {
    pub stream_id: String,
    pub class: IncidentClass,
    pub timestamp: NaiveDateTime,
    pub image_ref: String,
}

impl IncidentAlert {
    /// One-line message body, e.g. "Fight detected at CAM-07 at 2024-03-01 12:00:01.500"
    pub fn message(&self) -> String {
        format!(
            "{} detected at {} at {}",
            self.class.display_name(),
            self.stream_id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &IncidentAlert, image: &[u8]) -> Result<()>;
}

/// Webhook alert sink
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, Duration::from_secs(10))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("alert HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &IncidentAlert, image: &[u8]) -> Result<()> {
        let payload = serde_json::json!({ "content": alert.message() });

        let form = Form::new()
            .text("payload_json", payload.to_string())
            .part(
                "media",
                Part::bytes(image.to_vec())
                    .file_name("incident.jpg")
                    .mime_str("image/jpeg")?,
            );

        let resp = self.client.post(&self.url).multipart(form).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Alert(format!("webhook returned {} - {}", status, body)));
        }

        tracing::info!(
            stream_id = %alert.stream_id,
            class = %alert.class,
            "Sent {} alert to webhook",
            alert.class.display_name()
        );
        Ok(())
    }
}

/// Sink that keeps every alert in memory
#[derive(Default)]
pub struct RecordingAlertSink {
    sent: Mutex<Vec<(IncidentAlert, usize)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Alerts with the size of their attached image
    pub async fn sent(&self) -> Vec<(IncidentAlert, usize)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, alert: &IncidentAlert, image: &[u8]) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Alert("recording sink set to fail".into()));
        }
        self.sent.lock().await.push((alert.clone(), image.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_frame_ts;

    #[test]
    fn test_message_uses_display_name() {
        let alert = IncidentAlert {
            stream_id: "CAM-07".into(),
            class: IncidentClass::Altercation,
            timestamp: parse_frame_ts("2024-03-01 12:00:01.5").unwrap(),
            image_ref: "/tmp/x.jpg".into(),
        };
        assert_eq!(
            alert.message(),
            "Fight detected at CAM-07 at 2024-03-01 12:00:01.500"
        );
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_error() {
        let sink = WebhookAlertSink::with_timeout("http://127.0.0.1:1/hook", Duration::from_millis(200))
            .unwrap();
        let alert = IncidentAlert {
            stream_id: "CAM-01".into(),
            class: IncidentClass::Fire,
            timestamp: parse_frame_ts("2024-03-01 12:00:00").unwrap(),
            image_ref: String::new(),
        };
        assert!(sink.send(&alert, &[0xFF, 0xD8]).await.is_err());
    }
}
