//! InferenceClient - Detection model adapter
//!
//! ## Responsibilities
//!
//! - `InferenceEngine` seam: frame in, tracked vehicles and incident
//!   confidences out
//! - HTTP adapter for the inference service (`/v1/track`, `/healthz`)
//! - Scripted engine for tests and dry runs
//!
//! The model is a black box; nothing here keeps per-stream state.

use crate::models::{format_frame_ts, IncidentClass, VehicleClass};
use crate::track_registry::TrackId;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// Incident model class ids
pub const ACCIDENT_CLASS_ID: u32 = 3;
pub const FIRE_CLASS_ID: u32 = 8;
pub const ALTERCATION_CLASS_ID: u32 = 9;

/// One detector box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionBox {
    #[serde(default)]
    pub track_id: Option<TrackId>,
    pub class_id: u32,
    pub conf: f32,
}

/// Incident-model box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentBox {
    pub class_id: u32,
    pub conf: f32,
}

/// Per-class incident confidences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentConfidences {
    #[serde(default)]
    pub accident: f32,
    #[serde(default)]
    pub fire: f32,
    #[serde(default)]
    pub altercation: f32,
}

/// Raw response of `/v1/track`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackResponse {
    #[serde(default)]
    pub boxes: Vec<DetectionBox>,
    #[serde(default)]
    pub incident_boxes: Vec<IncidentBox>,
    #[serde(default)]
    pub incidents: Option<IncidentConfidences>,
}

/// Model output for one frame, in the core's vocabulary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInference {
    /// Visible tracked objects
    pub tracks: Vec<(TrackId, VehicleClass)>,
    /// Highest confidence per incident class
    pub incidents: BTreeMap<IncidentClass, f32>,
}

impl FrameInference {
    pub fn tracks(tracks: Vec<(TrackId, VehicleClass)>) -> Self {
        Self {
            tracks,
            incidents: BTreeMap::new(),
        }
    }

    pub fn with_incident(mut self, class: IncidentClass, conf: f32) -> Self {
        self.incidents.insert(class, conf);
        self
    }
}

impl From<TrackResponse> for FrameInference {
    fn from(resp: TrackResponse) -> Self {
        let tracks = resp
            .boxes
            .iter()
            .filter_map(|b| {
                let id = b.track_id?;
                VehicleClass::from_index(b.class_id).map(|class| (id, class))
            })
            .collect();

        let mut incidents = BTreeMap::new();
        match resp.incidents {
            Some(conf) => {
                incidents.insert(IncidentClass::Accident, conf.accident);
                incidents.insert(IncidentClass::Fire, conf.fire);
                incidents.insert(IncidentClass::Altercation, conf.altercation);
            }
            None => {
                for b in &resp.incident_boxes {
                    let class = match b.class_id {
                        ACCIDENT_CLASS_ID => IncidentClass::Accident,
                        FIRE_CLASS_ID => IncidentClass::Fire,
                        ALTERCATION_CLASS_ID => IncidentClass::Altercation,
                        _ => continue,
                    };
                    let best = incidents.entry(class).or_insert(0.0_f32);
                    if b.conf > *best {
                        *best = b.conf;
                    }
                }
            }
        }

        Self { tracks, incidents }
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn infer(
        &self,
        stream_id: &str,
        captured_at: &NaiveDateTime,
        frame: &[u8],
    ) -> Result<FrameInference>;

    async fn health_check(&self) -> bool;
}

/// HTTP inference client
pub struct InferenceClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("inference HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl InferenceEngine for InferenceClient {
    async fn infer(
        &self,
        stream_id: &str,
        captured_at: &NaiveDateTime,
        frame: &[u8],
    ) -> Result<FrameInference> {
        let url = format!("{}/v1/track", self.base_url);

        let form = Form::new()
            .part(
                "image",
                Part::bytes(frame.to_vec())
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("stream_id", stream_id.to_string())
            .text("captured_at", format_frame_ts(captured_at));

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "inference failed: {} - {}",
                status, body
            )));
        }

        let parsed: TrackResponse = resp
            .json()
            .await
            .map_err(|e| Error::Inference(format!("invalid response: {}", e)))?;
        Ok(parsed.into())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Engine that replays a fixed script, then reports empty frames
#[derive(Default)]
pub struct ScriptedInference {
    script: Mutex<VecDeque<Result<FrameInference>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedInference {
    pub fn new(frames: impl IntoIterator<Item = FrameInference>) -> Self {
        Self {
            script: Mutex::new(frames.into_iter().map(Ok).collect()),
            calls: Default::default(),
        }
    }

    /// Queue a failing frame
    pub async fn push_error(&self, error: Error) {
        self.script.lock().await.push_back(Err(error));
    }

    pub async fn push(&self, frame: FrameInference) {
        self.script.lock().await.push_back(Ok(frame));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for ScriptedInference {
    async fn infer(
        &self,
        _stream_id: &str,
        _captured_at: &NaiveDateTime,
        _frame: &[u8],
    ) -> Result<FrameInference> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(FrameInference::default()))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
