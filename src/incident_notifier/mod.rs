//! IncidentNotifier - Side effects of an incident trigger
//!
//! ## Responsibilities
//!
//! - Save the triggering frame under `<save_dir>/<DD Month YYYY>/<HH_MM_SS>_<uuid>.jpg`
//! - Insert the incident record
//! - Dispatch the alert (failures are logged, never fatal)

use crate::alert_dispatcher::{AlertSink, IncidentAlert};
use crate::incident_detector::IncidentTrigger;
use crate::persistence::{IncidentRecord, IncidentStore};
use crate::Result;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

/// Directory name for one day of captures, e.g. "01 March 2024"
pub fn day_dir_name(ts: &NaiveDateTime) -> String {
    ts.format("%d %B %Y").to_string()
}

pub struct IncidentNotifier {
    stream_id: String,
    save_dir: PathBuf,
    store: Arc<dyn IncidentStore>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl IncidentNotifier {
    pub fn new(
        stream_id: impl Into<String>,
        save_dir: impl Into<PathBuf>,
        store: Arc<dyn IncidentStore>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            save_dir: save_dir.into(),
            store,
            alerts,
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Write the frame to the dated capture directory
    pub async fn capture(&self, ts: &NaiveDateTime, image: &[u8]) -> Result<PathBuf> {
        let day_dir = self.save_dir.join(day_dir_name(ts));
        fs::create_dir_all(&day_dir).await?;

        let filename = format!("{}_{}.jpg", ts.format("%H_%M_%S"), Uuid::new_v4());
        let path = day_dir.join(filename);
        fs::write(&path, image).await?;

        tracing::debug!(
            stream_id = %self.stream_id,
            path = %path.display(),
            size = image.len(),
            "Saved incident frame"
        );
        Ok(path)
    }

    /// Capture, persist and alert for one trigger. Returns the stored record.
    pub async fn notify(&self, trigger: &IncidentTrigger, image: &[u8]) -> Result<IncidentRecord> {
        let path = self.capture(&trigger.timestamp, image).await?;
        let image_ref = path.display().to_string();

        let record = IncidentRecord {
            incident_id: Uuid::new_v4(),
            stream_id: self.stream_id.clone(),
            class: trigger.class,
            timestamp: trigger.timestamp,
            image_ref: image_ref.clone(),
        };
        self.store.insert_incident(&record).await?;

        if let Some(alerts) = &self.alerts {
            let alert = IncidentAlert {
                stream_id: self.stream_id.clone(),
                class: trigger.class,
                timestamp: trigger.timestamp,
                image_ref,
            };
            if let Err(e) = alerts.send(&alert, image).await {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    class = %trigger.class,
                    error = %e,
                    "{} alert failed",
                    trigger.class.display_name()
                );
            }
        }

        tracing::info!(
            stream_id = %self.stream_id,
            incident_id = %record.incident_id,
            class = %trigger.class,
            trigger_count = trigger.trigger_count,
            "Incident recorded"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_dispatcher::RecordingAlertSink;
    use crate::models::{parse_frame_ts, IncidentClass};
    use crate::persistence::MemoryIncidentStore;
    use std::time::Duration;

    fn trigger(raw: &str) -> IncidentTrigger {
        IncidentTrigger {
            class: IncidentClass::Fire,
            timestamp: parse_frame_ts(raw).unwrap(),
            trigger_count: 1,
            span: Duration::from_millis(900),
        }
    }

    #[test]
    fn test_day_dir_name() {
        let ts = parse_frame_ts("2024-03-01 09:30:00").unwrap();
        assert_eq!(day_dir_name(&ts), "01 March 2024");
    }

    #[tokio::test]
    async fn test_notify_writes_frame_record_and_alert() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIncidentStore::new());
        let sink = Arc::new(RecordingAlertSink::new());
        let notifier = IncidentNotifier::new("CAM-07", dir.path(), store.clone(), Some(sink.clone()));

        let record = notifier
            .notify(&trigger("2024-03-01 09:30:05.250"), &[0xFF, 0xD8, 0xFF, 0xD9])
            .await
            .unwrap();

        let path = PathBuf::from(&record.image_ref);
        assert!(path.starts_with(dir.path().join("01 March 2024")));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("09_30_05_"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(fs::read(&path).await.unwrap().len(), 4);

        assert_eq!(store.records().await, vec![record]);
        let sent = sink.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, 4);
    }

    #[tokio::test]
    async fn test_alert_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIncidentStore::new());
        let sink = Arc::new(RecordingAlertSink::new());
        sink.set_fail(true);
        let notifier = IncidentNotifier::new("CAM-07", dir.path(), store.clone(), Some(sink));

        notifier
            .notify(&trigger("2024-03-01 09:30:05"), &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIncidentStore::new());
        store.set_fail_writes(true);
        let notifier = IncidentNotifier::new("CAM-07", dir.path(), store, None);

        let err = notifier
            .notify(&trigger("2024-03-01 09:30:05"), &[1])
            .await
            .unwrap_err();
        assert!(err.is_persistence());
    }
}
