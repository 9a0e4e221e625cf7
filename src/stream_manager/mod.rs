//! StreamManager - Per-stream task isolation
//!
//! ## Responsibilities
//!
//! - Start a stream: the producer and/or consumer task this process runs
//!   (`StreamRole`) plus a health follower, all inside a `stream` span
//!   carrying the stream id
//! - Stop a stream: raise its shutdown signal and join its tasks
//! - Report per-stream supervisor state, counters and aggregates
//! - Restart streams whose session ended on a fatal error
//!
//! Streams share nothing mutable. A fatal producer or consumer ends the whole
//! stream; `restart_failed` brings it back with a fresh session that resumes
//! from storage.

use crate::broker::{queue_name, Broker};
use crate::config::{EngineConfig, Service, StreamConfig, StreamInventory, StreamRole};
use crate::consumer::ConsumerTransport;
use crate::frame_source::FrameSourceFactory;
use crate::producer::{ProducerCounters, ProducerStats, ProducerTransport};
use crate::session_orchestrator::{Collaborators, SessionOrchestrator, SessionReport};
use crate::stream_status_tracker::StreamStatusTracker;
use crate::stream_supervisor::{
    EndReason, SessionEnd, StreamSupervisor, SupervisorState, SupervisorStatus,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

/// Everything a stream needs besides its own config
#[derive(Clone)]
pub struct StreamRuntime {
    pub engine: EngineConfig,
    pub collaborators: Collaborators,
    pub broker: Arc<dyn Broker>,
    pub queue_prefix: String,
    pub sources: Arc<dyn FrameSourceFactory>,
    pub health: Arc<StreamStatusTracker>,
    pub role: StreamRole,
}

/// Status of one configured stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub uri: String,
    pub services: Vec<Service>,
    pub enabled: bool,
    pub role: StreamRole,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub producer: Option<SupervisorStatus>,
    pub consumer: Option<SupervisorStatus>,
    pub producer_stats: Option<ProducerStats>,
    pub session: Option<SessionReport>,
}

impl StreamStatus {
    /// Error that ended the stream, consumer first
    pub fn last_error(&self) -> Option<&str> {
        [&self.consumer, &self.producer]
            .into_iter()
            .flatten()
            .filter(|s| s.end == Some(EndReason::Fatal))
            .find_map(|s| s.last_error.as_deref())
    }
}

struct RunningStream {
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
    producer: Option<watch::Receiver<SupervisorStatus>>,
    consumer: Option<watch::Receiver<SupervisorStatus>>,
    counters: Option<Arc<ProducerCounters>>,
    report: Option<watch::Receiver<SessionReport>>,
}

impl RunningStream {
    fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Supervisors of the halves this process runs
    fn supervisors(&self) -> impl Iterator<Item = &watch::Receiver<SupervisorStatus>> {
        self.consumer.iter().chain(self.producer.iter())
    }

    /// Fatal if either half failed, otherwise how the lead half ended
    fn end_reason(&self) -> Option<EndReason> {
        let ends: Vec<Option<EndReason>> = self.supervisors().map(|s| s.borrow().end).collect();
        if ends.contains(&Some(EndReason::Fatal)) {
            return Some(EndReason::Fatal);
        }
        ends.into_iter().next().flatten()
    }

    fn ended_fatal(&self) -> bool {
        !self.is_running() && self.end_reason() == Some(EndReason::Fatal)
    }
}

pub struct StreamManager {
    runtime: StreamRuntime,
    inventory: StreamInventory,
    streams: RwLock<HashMap<String, RunningStream>>,
}

impl StreamManager {
    pub fn new(runtime: StreamRuntime, inventory: StreamInventory) -> Self {
        Self {
            runtime,
            inventory,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn inventory(&self) -> &StreamInventory {
        &self.inventory
    }

    pub fn role(&self) -> StreamRole {
        self.runtime.role
    }

    fn stream_config(&self, stream_id: &str) -> Result<&StreamConfig> {
        self.inventory
            .get(stream_id)
            .ok_or_else(|| Error::NotFound(format!("Stream not configured: {}", stream_id)))
    }

    /// Start a configured stream. Fails with `Conflict` if it is running.
    pub async fn start(&self, stream_id: &str) -> Result<StreamStatus> {
        let config = self.stream_config(stream_id)?.clone();

        let mut streams = self.streams.write().await;
        if streams.get(stream_id).map_or(false, |s| s.is_running()) {
            return Err(Error::Conflict(format!("Stream already running: {}", stream_id)));
        }

        let running = self.spawn_stream(&config);
        streams.insert(config.stream_id.clone(), running);
        drop(streams);

        tracing::info!(
            stream_id = %stream_id,
            uri = %config.uri,
            services = ?config.services,
            role = %self.runtime.role,
            "Stream started"
        );
        self.status(stream_id).await
    }

    fn spawn_stream(&self, config: &StreamConfig) -> RunningStream {
        let rt = &self.runtime;
        let stream_id = config.stream_id.clone();
        let queue = queue_name(&rt.queue_prefix, &stream_id);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let span = tracing::info_span!("stream", stream_id = %stream_id);

        let mut running = RunningStream {
            shutdown: shutdown.clone(),
            tasks: Vec::new(),
            started_at: Utc::now(),
            producer: None,
            consumer: None,
            counters: None,
            report: None,
        };

        if rt.role.runs_producer() {
            let producer = ProducerTransport::new(
                stream_id.clone(),
                queue.clone(),
                rt.broker.clone(),
                rt.sources.create(&stream_id, &config.uri),
            );
            running.counters = Some(producer.counters());
            let producer_sup = StreamSupervisor::new(
                stream_id.clone(),
                "producer",
                producer,
                rt.engine.supervisor.producer_policy(),
                &rt.engine.supervisor,
            );
            running.producer = Some(producer_sup.subscribe());

            let rx = shutdown_rx.clone();
            let shutdown = shutdown.clone();
            running.tasks.push(tokio::spawn(
                async move {
                    let exit = producer_sup.run(rx).await;
                    let stats = exit.transport.stats();
                    match exit.end {
                        SessionEnd::Fatal(e) => {
                            tracing::error!(error = %e, stats = ?stats, "Producer terminated, stopping stream");
                            shutdown.send_replace(true);
                        }
                        end => {
                            tracing::info!(stats = ?stats, end = ?end.reason(), "Producer finished");
                        }
                    }
                }
                .instrument(span.clone()),
            ));
        }

        if rt.role.runs_consumer() {
            let session = SessionOrchestrator::new(
                stream_id.clone(),
                &config.services,
                &rt.engine,
                &rt.collaborators,
            );
            running.report = Some(session.subscribe());
            let consumer_sup = StreamSupervisor::new(
                stream_id.clone(),
                "consumer",
                ConsumerTransport::new(queue, rt.broker.clone(), session),
                rt.engine.supervisor.consumer_policy(),
                &rt.engine.supervisor,
            );
            let consumer_status = consumer_sup.subscribe();
            running.consumer = Some(consumer_status.clone());

            let rx = shutdown_rx;
            let shutdown = shutdown.clone();
            running.tasks.push(tokio::spawn(
                async move {
                    let exit = consumer_sup.run(rx).await;
                    let session = exit.transport.into_session();
                    let report = session.report();
                    match exit.end {
                        SessionEnd::Fatal(e) => {
                            tracing::error!(
                                error = %e,
                                processed = report.frames_processed,
                                aggregate = ?report.counts,
                                "Consumer terminated, stopping stream"
                            );
                            shutdown.send_replace(true);
                        }
                        end => {
                            tracing::info!(
                                end = ?end.reason(),
                                processed = report.frames_processed,
                                aggregate = ?report.counts,
                                "Consumer finished"
                            );
                        }
                    }
                }
                .instrument(span.clone()),
            ));

            // Health rows follow the consumer side
            let health = rt.health.clone();
            let id = stream_id.clone();
            running.tasks.push(tokio::spawn(
                async move { health.watch(&id, consumer_status).await }.instrument(span),
            ));
        }

        running
    }

    /// Stop a running stream and wait for its tasks to finish
    pub async fn stop(&self, stream_id: &str) -> Result<StreamStatus> {
        let tasks = {
            let mut streams = self.streams.write().await;
            let running = streams
                .get_mut(stream_id)
                .filter(|s| s.is_running())
                .ok_or_else(|| Error::NotFound(format!("Stream not running: {}", stream_id)))?;
            running.shutdown.send_replace(true);
            std::mem::take(&mut running.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(stream_id = %stream_id, error = %e, "Stream task panicked");
            }
        }

        tracing::info!(stream_id = %stream_id, "Stream stopped");
        self.status(stream_id).await
    }

    pub async fn status(&self, stream_id: &str) -> Result<StreamStatus> {
        let config = self.stream_config(stream_id)?;
        let streams = self.streams.read().await;
        Ok(self.describe(config, streams.get(stream_id)))
    }

    /// Status of every configured stream
    pub async fn list(&self) -> Vec<StreamStatus> {
        let streams = self.streams.read().await;
        self.inventory
            .streams
            .iter()
            .map(|config| self.describe(config, streams.get(&config.stream_id)))
            .collect()
    }

    pub async fn running_count(&self) -> usize {
        self.streams
            .read()
            .await
            .values()
            .filter(|s| s.is_running())
            .count()
    }

    fn describe(&self, config: &StreamConfig, running: Option<&RunningStream>) -> StreamStatus {
        StreamStatus {
            stream_id: config.stream_id.clone(),
            uri: config.uri.clone(),
            services: config.services.clone(),
            enabled: config.enabled,
            role: self.runtime.role,
            running: running.map_or(false, |r| r.is_running()),
            started_at: running.map(|r| r.started_at),
            producer: running.and_then(|r| r.producer.as_ref()).map(|p| p.borrow().clone()),
            consumer: running.and_then(|r| r.consumer.as_ref()).map(|c| c.borrow().clone()),
            producer_stats: running.and_then(|r| r.counters.as_ref()).map(|c| c.snapshot()),
            session: running.and_then(|r| r.report.as_ref()).map(|r| r.borrow().clone()),
        }
    }

    /// Start every enabled stream; failures are logged per stream
    pub async fn start_enabled(&self) -> usize {
        let ids: Vec<String> = self.inventory.enabled().map(|s| s.stream_id.clone()).collect();
        let mut started = 0;
        for id in ids {
            match self.start(&id).await {
                Ok(_) => started += 1,
                Err(e) => tracing::error!(stream_id = %id, error = %e, "Failed to start stream"),
            }
        }
        started
    }

    /// Stop every running stream
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let streams = self.streams.read().await;
            streams
                .iter()
                .filter(|(_, s)| s.is_running())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::debug!(stream_id = %id, error = %e, "Stream already stopped");
            }
        }
    }

    /// Restart every stream that ended on a fatal error. Streams stopped by
    /// an operator stay stopped.
    pub async fn restart_failed(&self) -> usize {
        let failed: Vec<String> = {
            let streams = self.streams.read().await;
            streams
                .iter()
                .filter(|(_, s)| s.ended_fatal())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut restarted = 0;
        for id in failed {
            match self.start(&id).await {
                Ok(_) => {
                    tracing::warn!(stream_id = %id, "Stream restarted after fatal error");
                    restarted += 1;
                }
                Err(e) => tracing::error!(stream_id = %id, error = %e, "Stream restart failed"),
            }
        }
        restarted
    }

    /// Run `restart_failed` every `period` until `shutdown` is raised
    pub async fn watch_failed(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.restart_failed().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Resolve once the stream has terminated, with how it ended
    pub async fn wait_terminated(&self, stream_id: &str) -> Result<EndReason> {
        let supervisors: Vec<watch::Receiver<SupervisorStatus>> = {
            let streams = self.streams.read().await;
            streams
                .get(stream_id)
                .map(|s| s.supervisors().cloned().collect())
                .ok_or_else(|| Error::NotFound(format!("Stream not running: {}", stream_id)))?
        };
        for mut status in supervisors {
            // A dropped sender means the supervisor is gone as well
            let _ = status
                .wait_for(|s| s.state == SupervisorState::Terminated)
                .await;
        }

        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .and_then(|s| s.end_reason())
            .unwrap_or(EndReason::Stopped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::frame_source::{CapturedFrame, FrameSource, ScriptedFrameSource, SourceEnd, SourceScript};
    use crate::inference_client::{FrameInference, ScriptedInference};
    use crate::models::{parse_frame_ts, VehicleClass};
    use crate::persistence::{MemoryCountStore, MemoryHealthStore, MemoryIncidentStore};
    use std::time::Duration;

    struct OneShotSources;

    impl FrameSourceFactory for OneShotSources {
        fn create(&self, _stream_id: &str, _uri: &str) -> Box<dyn FrameSource> {
            let base = parse_frame_ts("2024-03-01 08:00:00").unwrap();
            let frames = (0..12)
                .map(|i| CapturedFrame {
                    timestamp: base + chrono::Duration::milliseconds(100 * i),
                    jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
                })
                .collect();
            Box::new(ScriptedFrameSource::new(vec![SourceScript {
                frames,
                end: SourceEnd::Stall,
                pace: Some(Duration::from_millis(50)),
            }]))
        }
    }

    fn manager(inference: Arc<ScriptedInference>) -> (StreamManager, Arc<MemoryHealthStore>) {
        let dir = std::env::temp_dir().join("va-stream-manager-test");
        let health_store = Arc::new(MemoryHealthStore::new());
        let runtime = StreamRuntime {
            engine: EngineConfig::default(),
            collaborators: Collaborators {
                inference,
                counts: Arc::new(MemoryCountStore::new()),
                incidents: Arc::new(MemoryIncidentStore::new()),
                alerts: None,
                incident_save_dir: dir,
            },
            broker: Arc::new(MemoryBroker::new()),
            queue_prefix: "va".into(),
            sources: Arc::new(OneShotSources),
            health: Arc::new(StreamStatusTracker::new(health_store.clone())),
            role: StreamRole::Both,
        };
        let inventory = StreamInventory::from_json(
            r#"{"streams": [
                {"stream_id": "CAM-A", "uri": "rtsp://a", "services": ["congestion"]},
                {"stream_id": "CAM-B", "uri": "rtsp://b", "enabled": false}
            ]}"#,
        )
        .unwrap();
        (StreamManager::new(runtime, inventory), health_store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_lifecycle() {
        let mut script = vec![FrameInference::tracks(vec![(1, VehicleClass::Bus)])];
        script.extend((0..11).map(|_| FrameInference::default()));
        let (manager, health) = manager(Arc::new(ScriptedInference::new(script)));

        assert_eq!(manager.start_enabled().await, 1);
        assert!(matches!(manager.start("CAM-A").await, Err(Error::Conflict(_))));
        assert!(matches!(manager.start("CAM-Z").await, Err(Error::NotFound(_))));
        assert!(matches!(manager.stop("CAM-B").await, Err(Error::NotFound(_))));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = manager.status("CAM-A").await.unwrap();
        assert!(status.running);
        assert_eq!(status.producer_stats.unwrap().frames_published, 12);
        let session = status.session.unwrap();
        assert_eq!(session.frames_processed, 12);
        assert_eq!(session.counts.get("bus"), Some(&1));
        assert_eq!(manager.running_count().await, 1);

        let stopped = manager.stop("CAM-A").await.unwrap();
        assert!(!stopped.running);
        assert_eq!(stopped.consumer.unwrap().state, SupervisorState::Terminated);
        assert!(matches!(manager.stop("CAM-A").await, Err(Error::NotFound(_))));

        let events = health.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].response_code, 499);

        // Restart after stop is allowed
        manager.start("CAM-A").await.unwrap();
        manager.stop_all().await;
        assert_eq!(manager.running_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_consumer_stops_stream() {
        let inference = Arc::new(ScriptedInference::new(vec![]));
        inference
            .push_error(Error::Inference("model unavailable".into()))
            .await;
        let (manager, _) = manager(inference);

        manager.start("CAM-A").await.unwrap();
        assert_eq!(manager.wait_terminated("CAM-A").await.unwrap(), EndReason::Fatal);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let listed = manager.list().await;
        assert_eq!(listed.len(), 2);
        let cam_a = &listed[0];
        assert!(!cam_a.running);
        assert_eq!(cam_a.consumer.as_ref().unwrap().end, Some(EndReason::Fatal));
        assert!(cam_a.last_error().unwrap_or("").contains("model unavailable"));
        assert!(!listed[1].running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stream_restarts_with_fresh_session() {
        let inference = Arc::new(ScriptedInference::new(vec![]));
        inference
            .push_error(Error::Inference("model unavailable".into()))
            .await;
        let (manager, _) = manager(inference);
        let manager = Arc::new(manager);

        manager.start("CAM-A").await.unwrap();
        assert_eq!(manager.wait_terminated("CAM-A").await.unwrap(), EndReason::Fatal);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let watcher = tokio::spawn(manager.clone().watch_failed(Duration::from_secs(30), stop_rx));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!manager.status("CAM-A").await.unwrap().running);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = manager.status("CAM-A").await.unwrap();
        assert!(status.running);
        let session = status.session.unwrap();
        // the failed frame was requeued and is processed by the new session
        assert!(session.frames_processed >= 12);
        assert_eq!(session.resumes, 1);

        // operator stop is final
        manager.stop("CAM-A").await.unwrap();
        assert_eq!(manager.restart_failed().await, 0);
        assert!(!manager.status("CAM-A").await.unwrap().running);

        stop_tx.send(true).unwrap();
        watcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_only_role() {
        let (manager, health) = manager(Arc::new(ScriptedInference::new(vec![])));
        let mut runtime = manager.runtime.clone();
        runtime.role = StreamRole::Producer;
        let manager = StreamManager::new(runtime, manager.inventory.clone());

        manager.start("CAM-A").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let status = manager.status("CAM-A").await.unwrap();
        assert_eq!(status.role, StreamRole::Producer);
        assert_eq!(status.producer_stats.unwrap().frames_published, 12);
        assert!(status.consumer.is_none());
        assert!(status.session.is_none());

        manager.stop("CAM-A").await.unwrap();
        assert_eq!(manager.wait_terminated("CAM-A").await.unwrap(), EndReason::Stopped);
        assert!(health.events().await.is_empty());
    }
}
