//! SessionOrchestrator - Per-stream frame pipeline
//!
//! ## Responsibilities
//!
//! - Own all per-stream state: track registry, bucket aggregator, incident
//!   windows and message counters
//! - Resume counts from storage on the first frame and after any reconnect
//! - Per frame: bucket rollover -> inference -> tracking -> persist ->
//!   incident windows -> notifications
//!
//! A frame is complete only when `handle_frame` returns `Ok`; the caller
//! acknowledges it after that and never before.

use crate::alert_dispatcher::AlertSink;
use crate::bucket_aggregator::{BucketAggregator, ClosedBucket};
use crate::config::{EngineConfig, Service};
use crate::incident_detector::{IncidentConfig, IncidentVerdicts, IncidentWindowDetector};
use crate::incident_notifier::IncidentNotifier;
use crate::inference_client::InferenceEngine;
use crate::models::{format_frame_ts, FrameMessage, IncidentClass};
use crate::persistence::{CountStore, IncidentRecord, IncidentStore};
use crate::track_registry::{AggregateCountSet, TrackRegistry, TrackerConfig};
use crate::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// External collaborators shared by all sessions
#[derive(Clone)]
pub struct Collaborators {
    pub inference: Arc<dyn InferenceEngine>,
    pub counts: Arc<dyn CountStore>,
    pub incidents: Arc<dyn IncidentStore>,
    pub alerts: Option<Arc<dyn AlertSink>>,
    pub incident_save_dir: PathBuf,
}

/// Incident window status of one class
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncidentStatus {
    pub counter: usize,
    pub trigger_count: u64,
    pub last_notified: Option<String>,
}

/// Published session snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub resumes: u64,
    pub last_timestamp: Option<String>,
    pub bucket: Option<String>,
    pub counts: BTreeMap<&'static str, u32>,
    pub active_tracks: usize,
    pub incidents: BTreeMap<&'static str, IncidentStatus>,
}

/// What one frame changed
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub resumed: bool,
    pub closed_bucket: Option<ClosedBucket>,
    pub incidents: Vec<IncidentRecord>,
}

struct IncidentPipeline {
    detector: IncidentWindowDetector,
    notifier: IncidentNotifier,
    threshold: f32,
}

pub struct SessionOrchestrator {
    stream_id: String,
    inference: Arc<dyn InferenceEngine>,
    tracker_config: TrackerConfig,
    registry: TrackRegistry,
    aggregator: Option<BucketAggregator>,
    incident: Option<IncidentPipeline>,
    frames_received: u64,
    frames_processed: u64,
    resumes: u64,
    current_day: Option<NaiveDate>,
    last_timestamp: Option<NaiveDateTime>,
    report: watch::Sender<SessionReport>,
}

impl SessionOrchestrator {
    pub fn new(
        stream_id: impl Into<String>,
        services: &[Service],
        engine: &EngineConfig,
        collaborators: &Collaborators,
    ) -> Self {
        let stream_id = stream_id.into();

        let aggregator = services
            .contains(&Service::Congestion)
            .then(|| BucketAggregator::new(stream_id.clone(), collaborators.counts.clone()));

        let incident = services.contains(&Service::Incident).then(|| {
            Self::incident_pipeline(&stream_id, engine.incident.clone(), collaborators)
        });

        let (report, _) = watch::channel(SessionReport::default());

        Self {
            inference: collaborators.inference.clone(),
            tracker_config: engine.tracker.clone(),
            registry: TrackRegistry::new(engine.tracker.clone()),
            aggregator,
            incident,
            frames_received: 0,
            frames_processed: 0,
            resumes: 0,
            current_day: None,
            last_timestamp: None,
            report,
            stream_id,
        }
    }

    fn incident_pipeline(
        stream_id: &str,
        config: IncidentConfig,
        collaborators: &Collaborators,
    ) -> IncidentPipeline {
        IncidentPipeline {
            threshold: config.confidence_threshold,
            detector: IncidentWindowDetector::new(config),
            notifier: IncidentNotifier::new(
                stream_id,
                collaborators.incident_save_dir.clone(),
                collaborators.incidents.clone(),
                collaborators.alerts.clone(),
            ),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionReport> {
        self.report.subscribe()
    }

    /// Last aggregate held in memory, for error context
    pub fn last_aggregate(&self) -> AggregateCountSet {
        self.registry.snapshot()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Process one frame. `resume` forces a reload of persisted counts
    /// before the frame is applied.
    pub async fn handle_frame(&mut self, message: &FrameMessage, resume: bool) -> Result<FrameOutcome> {
        self.frames_received += 1;
        let ts = message.timestamp;
        let mut outcome = FrameOutcome::default();

        self.note_day(&ts);

        if let Some(aggregator) = self.aggregator.as_mut() {
            if self.frames_received == 1 || resume {
                let seeded = aggregator.resume(&ts).await?;
                self.registry = TrackRegistry::with_aggregate(self.tracker_config.clone(), seeded);
                self.resumes += 1;
                outcome.resumed = true;
            } else {
                outcome.closed_bucket = aggregator.on_frame(&ts, &mut self.registry).await?;
            }
        }

        let inference = self
            .inference
            .infer(&self.stream_id, &ts, &message.payload)
            .await?;

        if let Some(aggregator) = self.aggregator.as_mut() {
            let evicted = self.registry.update_frame(&inference.tracks).evicted;
            if !evicted.is_empty() {
                tracing::debug!(
                    stream_id = %self.stream_id,
                    evicted = ?evicted,
                    "Tracks evicted"
                );
            }
            aggregator.commit(&self.registry.snapshot()).await?;
        }

        if let Some(pipeline) = self.incident.as_mut() {
            let verdicts =
                IncidentVerdicts::from_confidences(inference.incidents.iter().map(|(c, v)| (*c, *v)), pipeline.threshold);
            for trigger in pipeline.detector.on_frame(ts, &verdicts) {
                let record = pipeline.notifier.notify(&trigger, &message.payload).await?;
                outcome.incidents.push(record);
            }
        }

        self.frames_processed += 1;
        self.last_timestamp = Some(ts);

        tracing::debug!(
            stream_id = %self.stream_id,
            "Processed {} | {} | Resume {} | {:?}",
            self.frames_processed,
            format_frame_ts(&ts),
            outcome.resumed,
            self.registry.snapshot().vehicle_summary()
        );

        self.publish_report();
        Ok(outcome)
    }

    fn note_day(&mut self, ts: &NaiveDateTime) {
        let day = ts.date();
        match self.current_day {
            Some(prev) if prev == day => {}
            Some(prev) => {
                tracing::info!(
                    stream_id = %self.stream_id,
                    from = %prev,
                    to = %day,
                    "Day changed"
                );
                self.current_day = Some(day);
            }
            None => self.current_day = Some(day),
        }
    }

    pub fn report(&self) -> SessionReport {
        let incidents = self
            .incident
            .as_ref()
            .map(|pipeline| {
                IncidentClass::ALL
                    .iter()
                    .filter_map(|class| pipeline.detector.window(*class))
                    .map(|w| {
                        (
                            w.class().as_str(),
                            IncidentStatus {
                                counter: w.counter(),
                                trigger_count: w.trigger_count(),
                                last_notified: w.last_notified().as_ref().map(format_frame_ts),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        SessionReport {
            frames_received: self.frames_received,
            frames_processed: self.frames_processed,
            resumes: self.resumes,
            last_timestamp: self.last_timestamp.as_ref().map(format_frame_ts),
            bucket: self
                .aggregator
                .as_ref()
                .and_then(|a| a.current())
                .map(|k| k.to_string()),
            counts: self.registry.snapshot().vehicle_summary(),
            active_tracks: self.registry.active_tracks(),
            incidents,
        }
    }

    fn publish_report(&self) {
        self.report.send_replace(self.report());
    }
}
