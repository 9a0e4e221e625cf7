//! Stream inventory and engine tunables
//!
//! Loaded from a JSON file (`STREAMS_FILE`):
//!
//! ```json
//! {
//!   "engine": { "tracker": { "max_frames_absent": 10 } },
//!   "streams": [
//!     { "stream_id": "CAM-07", "uri": "rtsp://10.0.0.7/stream1",
//!       "services": ["congestion", "incident"] }
//!   ]
//! }
//! ```
//!
//! Every tunable falls back to its default when omitted.

use crate::frame_source::CaptureConfig;
use crate::incident_detector::IncidentConfig;
use crate::stream_supervisor::SupervisorConfig;
use crate::track_registry::TrackerConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Analytics enabled for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Vehicle counting into 15-minute buckets
    Congestion,
    /// Accident / fire / altercation detection
    Incident,
}

/// Which halves of a stream this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    /// Producer and consumer in one process
    #[default]
    Both,
    /// Capture and publish only
    Producer,
    /// Consume, infer and persist only
    Consumer,
}

impl StreamRole {
    pub fn runs_producer(self) -> bool {
        matches!(self, StreamRole::Both | StreamRole::Producer)
    }

    pub fn runs_consumer(self) -> bool {
        matches!(self, StreamRole::Both | StreamRole::Consumer)
    }
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamRole::Both => "both",
            StreamRole::Producer => "producer",
            StreamRole::Consumer => "consumer",
        };
        f.write_str(name)
    }
}

fn default_services() -> Vec<Service> {
    vec![Service::Congestion, Service::Incident]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_id: String,
    /// RTSP url or local video file
    pub uri: String,
    #[serde(default = "default_services")]
    pub services: Vec<Service>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StreamConfig {
    pub fn has(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    fn validate(&self) -> Result<()> {
        if self.stream_id.is_empty() {
            return Err(Error::Config("stream_id must not be empty".into()));
        }
        if !self
            .stream_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "stream_id '{}' may only contain [A-Za-z0-9_-]",
                self.stream_id
            )));
        }
        if self.uri.trim().is_empty() {
            return Err(Error::Config(format!("stream '{}' has no uri", self.stream_id)));
        }
        if self.services.is_empty() {
            return Err(Error::Config(format!(
                "stream '{}' enables no services",
                self.stream_id
            )));
        }
        Ok(())
    }
}

/// Tunables shared by every stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub incident: IncidentConfig,
    pub supervisor: SupervisorConfig,
    pub capture: CaptureConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tracker.max_frames_absent == 0 {
            return Err(Error::Validation("tracker max_frames_absent must be > 0".into()));
        }
        self.incident.validate()?;
        self.supervisor.validate()?;
        self.capture.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInventory {
    #[serde(default)]
    pub engine: EngineConfig,
    pub streams: Vec<StreamConfig>,
}

impl StreamInventory {
    pub fn from_json(raw: &str) -> Result<Self> {
        let inventory: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid stream inventory: {}", e)))?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let inventory = Self::from_json(&raw)?;

        tracing::info!(
            path = %path.display(),
            streams = inventory.streams.len(),
            enabled = inventory.enabled().count(),
            "Stream inventory loaded"
        );
        Ok(inventory)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        let mut seen = HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !seen.insert(stream.stream_id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate stream_id '{}'",
                    stream.stream_id
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IncidentClass;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let inventory = StreamInventory::from_json(
            r#"{
                "engine": { "incident": { "confidence_threshold": 0.6 } },
                "streams": [
                    { "stream_id": "CAM-07", "uri": "rtsp://10.0.0.7/stream1" },
                    { "stream_id": "CAM-08", "uri": "/data/cam8.mp4",
                      "services": ["incident"], "enabled": false }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(inventory.engine.incident.confidence_threshold, 0.6);
        assert_eq!(inventory.engine.incident.window_size, 25);
        assert_eq!(
            inventory.engine.incident.limit(IncidentClass::Accident).as_millis(),
            2_000
        );
        assert_eq!(inventory.engine.tracker.max_frames_absent, 10);
        assert_eq!(inventory.engine.supervisor.producer_stale_secs, 120);

        let cam7 = inventory.get("CAM-07").unwrap();
        assert!(cam7.enabled);
        assert!(cam7.has(Service::Congestion) && cam7.has(Service::Incident));

        let cam8 = inventory.get("CAM-08").unwrap();
        assert!(!cam8.has(Service::Congestion));
        assert_eq!(inventory.enabled().count(), 1);
    }

    #[test]
    fn test_rejects_duplicates_and_bad_ids() {
        let dup = r#"{"streams": [
            {"stream_id": "A", "uri": "x"}, {"stream_id": "A", "uri": "y"}
        ]}"#;
        assert!(matches!(StreamInventory::from_json(dup), Err(Error::Config(_))));

        let bad_id = r#"{"streams": [{"stream_id": "cam 1", "uri": "x"}]}"#;
        assert!(StreamInventory::from_json(bad_id).is_err());

        let no_services = r#"{"streams": [{"stream_id": "A", "uri": "x", "services": []}]}"#;
        assert!(StreamInventory::from_json(no_services).is_err());
    }

    #[test]
    fn test_rejects_order_beyond_spike_history() {
        let raw = r#"{"engine": {"incident": {"order": 31}}, "streams": []}"#;
        assert!(matches!(
            StreamInventory::from_json(raw),
            Err(Error::Validation(_))
        ));
    }
}
