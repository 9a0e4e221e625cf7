//! Producer - Frame source to broker transport
//!
//! ## Responsibilities
//!
//! - Build the media pipeline and broker channel for one stream
//! - Publish every captured frame with its capture timestamp
//! - Mark the first frame after a rebuild with `resume`
//! - Count received / published / unsent frames
//!
//! Driven by a `StreamSupervisor` with the polling watchdog: a heartbeat is
//! recorded on every successful publish.

use crate::broker::{Broker, BrokerConnection};
use crate::frame_source::FrameSource;
use crate::models::{format_frame_ts, FrameMessage};
use crate::stream_supervisor::{Heartbeat, SupervisedTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live producer counters, shared with the status API
#[derive(Debug, Default)]
pub struct ProducerCounters {
    received: AtomicU64,
    published: AtomicU64,
    unsent: AtomicU64,
}

impl ProducerCounters {
    pub fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            frames_received: self.received.load(Ordering::Relaxed),
            frames_published: self.published.load(Ordering::Relaxed),
            frames_unsent: self.unsent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStats {
    pub frames_received: u64,
    pub frames_published: u64,
    pub frames_unsent: u64,
}

pub struct ProducerTransport {
    stream_id: String,
    queue: String,
    broker: Arc<dyn Broker>,
    source: Box<dyn FrameSource>,
    connection: Option<Box<dyn BrokerConnection>>,
    resume_next: bool,
    counters: Arc<ProducerCounters>,
}

impl ProducerTransport {
    pub fn new(
        stream_id: impl Into<String>,
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        source: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            queue: queue.into(),
            broker,
            source,
            connection: None,
            resume_next: false,
            counters: Arc::new(ProducerCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<ProducerCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> ProducerStats {
        self.counters.snapshot()
    }
}

#[async_trait]
impl SupervisedTransport for ProducerTransport {
    async fn open(&mut self) -> Result<()> {
        let mut connection = self.broker.connect().await?;
        connection.declare_queue(&self.queue).await?;
        self.connection = Some(connection);

        self.source.start().await?;
        tracing::info!(stream_id = %self.stream_id, queue = %self.queue, "Producer pipeline playing");
        Ok(())
    }

    async fn drive(&mut self, heartbeat: &Heartbeat) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Transport("producer channel not open".into()))?;

        loop {
            let frame = match self.source.next_frame().await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            let message = FrameMessage::new(frame.timestamp, frame.jpeg).with_resume(self.resume_next);
            if let Err(e) = connection.publish(&self.queue, &message).await {
                let unsent = self.counters.unsent.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    stream_id = %self.stream_id,
                    unsent = unsent,
                    error = %e,
                    "Channel not available, frame not sent"
                );
                return Err(e);
            }

            let published = self.counters.published.fetch_add(1, Ordering::Relaxed) + 1;
            heartbeat.beat();
            if self.resume_next {
                tracing::info!(
                    stream_id = %self.stream_id,
                    timestamp = %format_frame_ts(&message.timestamp),
                    "Published resume frame"
                );
                self.resume_next = false;
            }
            tracing::trace!(
                stream_id = %self.stream_id,
                published = published,
                bytes = message.payload.len(),
                "Frame published"
            );
        }
    }

    async fn close(&mut self) -> Result<()> {
        let stopped = self.source.stop().await;
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::debug!(stream_id = %self.stream_id, error = %e, "Broker connection already gone");
            }
        }
        stopped
    }

    fn mark_recovering(&mut self) {
        self.resume_next = true;
    }
}
