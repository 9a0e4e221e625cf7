//! Consumer - Broker to session transport
//!
//! ## Responsibilities
//!
//! - Open the broker channel for one stream's queue
//! - Hand every delivery to the `SessionOrchestrator`
//! - Acknowledge only after the frame was fully processed
//! - Mark the first delivery after a reconnect as `resume`
//!
//! Staleness is signalled by the broker itself (a lost connection fails
//! `receive`), so the supervisor runs it with `WatchdogPolicy::ConnectionSignal`.

use crate::broker::{Broker, BrokerConnection};
use crate::models::format_frame_ts;
use crate::session_orchestrator::SessionOrchestrator;
use crate::stream_supervisor::{Heartbeat, SupervisedTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub struct ConsumerTransport {
    stream_id: String,
    queue: String,
    broker: Arc<dyn Broker>,
    connection: Option<Box<dyn BrokerConnection>>,
    session: SessionOrchestrator,
    recovering: bool,
    dropped: u64,
}

impl ConsumerTransport {
    pub fn new(queue: impl Into<String>, broker: Arc<dyn Broker>, session: SessionOrchestrator) -> Self {
        Self {
            stream_id: session.stream_id().to_string(),
            queue: queue.into(),
            broker,
            connection: None,
            session,
            recovering: false,
            dropped: 0,
        }
    }

    pub fn session(&self) -> &SessionOrchestrator {
        &self.session
    }

    pub fn into_session(self) -> SessionOrchestrator {
        self.session
    }

    /// Deliveries discarded for unreadable headers
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[async_trait]
impl SupervisedTransport for ConsumerTransport {
    async fn open(&mut self) -> Result<()> {
        let mut connection = self.broker.connect().await?;
        connection.declare_queue(&self.queue).await?;
        self.connection = Some(connection);
        tracing::info!(stream_id = %self.stream_id, queue = %self.queue, "Consuming");
        Ok(())
    }

    async fn drive(&mut self, heartbeat: &Heartbeat) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Transport("consumer channel not open".into()))?;

        loop {
            let delivery = connection.receive(&self.queue).await?;
            heartbeat.beat();

            let message = match delivery.message() {
                Ok(message) => message,
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        tag = delivery.tag,
                        error = %e,
                        "Dropping frame with unreadable headers"
                    );
                    connection.ack(delivery.tag).await?;
                    continue;
                }
            };

            let resume = message.resume || self.recovering;
            if let Err(e) = self.session.handle_frame(&message, resume).await {
                tracing::error!(
                    stream_id = %self.stream_id,
                    timestamp = %format_frame_ts(&message.timestamp),
                    redelivered = delivery.redelivered,
                    aggregate = ?self.session.last_aggregate().vehicle_summary(),
                    error = %e,
                    "Frame processing failed, leaving frame unacknowledged"
                );
                return Err(e);
            }
            self.recovering = false;

            connection.ack(delivery.tag).await?;
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await?;
        }
        Ok(())
    }

    fn mark_recovering(&mut self) {
        self.recovering = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{queue_name, MemoryBroker};
    use crate::bucket_aggregator::BucketKey;
    use crate::config::{EngineConfig, Service};
    use crate::inference_client::{FrameInference, ScriptedInference};
    use crate::models::{parse_frame_ts, FrameHeaders, FrameMessage, VehicleClass};
    use crate::persistence::{CountStore, MemoryCountStore, MemoryIncidentStore};
    use crate::session_orchestrator::Collaborators;
    use crate::stream_supervisor::{SessionEnd, StreamSupervisor, SupervisorConfig, SupervisorState};
    use std::time::Duration;
    use tokio::sync::watch;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        counts: Arc<MemoryCountStore>,
        inference: Arc<ScriptedInference>,
        _dir: tempfile::TempDir,
        queue: String,
    }

    impl Fixture {
        fn new(frames: Vec<FrameInference>) -> (Self, ConsumerTransport) {
            let broker = Arc::new(MemoryBroker::new());
            let counts = Arc::new(MemoryCountStore::new());
            let inference = Arc::new(ScriptedInference::new(frames));
            let dir = tempfile::tempdir().unwrap();
            let collaborators = Collaborators {
                inference: inference.clone(),
                counts: counts.clone(),
                incidents: Arc::new(MemoryIncidentStore::new()),
                alerts: None,
                incident_save_dir: dir.path().to_path_buf(),
            };
            let session = SessionOrchestrator::new(
                "CAM-05",
                &[Service::Congestion],
                &EngineConfig::default(),
                &collaborators,
            );
            let queue = queue_name("va", "CAM-05");
            let transport = ConsumerTransport::new(&queue, broker.clone(), session);
            (
                Self {
                    broker,
                    counts,
                    inference,
                    _dir: dir,
                    queue,
                },
                transport,
            )
        }

        async fn publish(&self, ts: &str, resume: bool) {
            let mut conn = self.broker.connect().await.unwrap();
            conn.declare_queue(&self.queue).await.unwrap();
            let msg = FrameMessage::new(parse_frame_ts(ts).unwrap(), vec![7]).with_resume(resume);
            conn.publish(&self.queue, &msg).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_processed_frames() {
        let (fx, transport) = Fixture::new(vec![]);
        for i in 0..3 {
            fx.publish(&format!("2024-03-01 11:00:0{}", i), false).await;
        }

        let sup = StreamSupervisor::new(
            "CAM-05",
            "consumer",
            transport,
            SupervisorConfig::default().consumer_policy(),
            &SupervisorConfig::default(),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send(true).unwrap();
        let exit = task.await.unwrap();

        assert!(matches!(exit.end, SessionEnd::Stopped));
        assert_eq!(exit.transport.session().frames_processed(), 3);
        assert_eq!(fx.broker.queue_len(&fx.queue), 0);
        assert_eq!(fx.broker.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_frame_is_requeued() {
        let (fx, transport) = Fixture::new(vec![]);
        fx.inference.push(FrameInference::default()).await;
        fx.inference
            .push_error(Error::Inference("bad tensor".into()))
            .await;
        fx.publish("2024-03-01 11:00:00", false).await;
        fx.publish("2024-03-01 11:00:01", false).await;

        let sup = StreamSupervisor::new(
            "CAM-05",
            "consumer",
            transport,
            SupervisorConfig::default().consumer_policy(),
            &SupervisorConfig::default(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let exit = sup.run(stop_rx).await;

        assert!(matches!(exit.end, SessionEnd::Fatal(Error::Inference(_))));
        assert_eq!(exit.transport.session().frames_processed(), 1);
        // second frame went back to the queue on close
        assert_eq!(fx.broker.queue_len(&fx.queue), 1);
        assert_eq!(fx.broker.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_from_storage() {
        let (fx, transport) = Fixture::new(vec![]);
        let sup = StreamSupervisor::new(
            "CAM-05",
            "consumer",
            transport,
            SupervisorConfig::default().consumer_policy(),
            &SupervisorConfig::default(),
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        fx.publish("2024-03-01 11:00:00", false).await;
        status.wait_for(|s| s.state == SupervisorState::Live).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Counts written elsewhere while the connection is down
        let key = BucketKey::from_timestamp(&parse_frame_ts("2024-03-01 11:00:00").unwrap());
        let external: crate::track_registry::AggregateCountSet =
            [(VehicleClass::Bus, 2)].into_iter().collect();
        fx.counts.upsert_counts("CAM-05", &key, &external).await.unwrap();
        fx.broker.sever();

        status
            .wait_for(|s| s.state == SupervisorState::Live && s.recoveries == 1)
            .await
            .unwrap();
        fx.publish("2024-03-01 11:00:05", false).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(true).unwrap();
        let exit = task.await.unwrap();
        let session = exit.transport.session();
        assert_eq!(session.frames_processed(), 2);
        assert_eq!(session.last_aggregate().get(VehicleClass::Bus), 2);
        assert_eq!(session.report().resumes, 2);
    }

    #[tokio::test]
    async fn test_unreadable_headers_are_dropped() {
        let (fx, mut transport) = Fixture::new(vec![]);
        let mut conn = fx.broker.connect().await.unwrap();
        conn.declare_queue(&fx.queue).await.unwrap();
        fx.broker.inject_raw(
            &fx.queue,
            FrameHeaders {
                timestamp: "yesterday".into(),
                resume: None,
            },
            vec![1],
        );
        fx.publish("2024-03-01 11:00:00", false).await;

        transport.open().await.unwrap();
        let heartbeat = Heartbeat::new();
        let _ = tokio::time::timeout(Duration::from_millis(200), transport.drive(&heartbeat)).await;

        assert_eq!(transport.dropped(), 1);
        assert_eq!(transport.session().frames_processed(), 1);
        assert_eq!(heartbeat.beats(), 2);
        transport.close().await.unwrap();
        assert_eq!(fx.broker.queue_len(&fx.queue), 0);
    }
}
