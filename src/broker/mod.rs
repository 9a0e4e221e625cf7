//! Broker - Durable per-stream frame queues
//!
//! ## Responsibilities
//!
//! - `Broker` / `BrokerConnection` seam between producer and consumer
//! - `AmqpBroker`: durable queues on RabbitMQ, for producer and consumer
//!   running in separate processes
//! - `MemoryBroker`: in-process named queues with at-least-once delivery
//!
//! ## Delivery semantics
//!
//! - Messages carry wire headers (`timestamp`, optional `resume`) and an opaque payload
//! - A delivery stays unacked until `ack`; closing or losing the connection
//!   puts its unacked deliveries back at the front of their queue, flagged redelivered
//! - `sever()` drops every live connection at once (connection loss),
//!   `set_available(false)` additionally refuses new connections

mod amqp;

pub use amqp::{AmqpBroker, DEFAULT_PREFETCH};

use crate::config::StreamRole;
use crate::models::{FrameHeaders, FrameMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Queue name of a stream
pub fn queue_name(prefix: &str, stream_id: &str) -> String {
    if prefix.is_empty() {
        stream_id.to_string()
    } else {
        format!("{}.{}", prefix, stream_id)
    }
}

/// Broker for this process: AMQP when `url` is set, otherwise in-process.
/// A producer-only or consumer-only process cannot use the in-process broker.
pub fn select_broker(url: Option<&str>, prefetch: u16, role: StreamRole) -> Result<Arc<dyn Broker>> {
    match url {
        Some(url) => Ok(Arc::new(AmqpBroker::new(url).with_prefetch(prefetch))),
        None if role == StreamRole::Both => Ok(Arc::new(MemoryBroker::new())),
        None => Err(Error::Config(format!(
            "role '{}' needs BROKER_URL: the in-process broker only links producer and consumer of one process",
            role
        ))),
    }
}

/// One received message, unacked until `BrokerConnection::ack`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub headers: FrameHeaders,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl Delivery {
    /// Decode headers into a frame message
    pub fn message(&self) -> Result<FrameMessage> {
        FrameMessage::from_headers(&self.headers, self.payload.clone())
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send {
    /// Declare a durable queue; declaring twice is a no-op
    async fn declare_queue(&mut self, queue: &str) -> Result<()>;

    async fn publish(&mut self, queue: &str, message: &FrameMessage) -> Result<()>;

    /// Wait for the next message. Fails with a transport error on connection loss.
    async fn receive(&mut self, queue: &str) -> Result<Delivery>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    headers: FrameHeaders,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    generation: u64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    next_connection: u64,
}

impl BrokerState {
    /// Requeue unacked deliveries, all of them or those of one connection,
    /// preserving their original order at the queue front
    fn requeue(&mut self, connection: Option<u64>) -> usize {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| connection.map_or(true, |c| u.connection == c))
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.iter().rev() {
            if let Some(mut entry) = self.unacked.remove(tag) {
                entry.message.redelivered = true;
                self.queues
                    .entry(entry.queue)
                    .or_default()
                    .push_front(entry.message);
            }
        }
        tags.len()
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    available: true,
                    generation: 0,
                    queues: HashMap::new(),
                    unacked: BTreeMap::new(),
                    next_tag: 1,
                    next_connection: 1,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Drop every live connection; their unacked deliveries are requeued
    pub fn sever(&self) {
        let requeued = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.requeue(None)
        };
        self.shared.notify.notify_waiters();
        tracing::warn!(requeued, "Broker connections severed");
    }

    /// Refuse (false) or accept (true) connections. Going unavailable severs.
    pub fn set_available(&self, available: bool) {
        let was = {
            let mut state = self.shared.lock();
            std::mem::replace(&mut state.available, available)
        };
        if was && !available {
            self.sever();
        }
    }

    pub fn is_available(&self) -> bool {
        self.shared.lock().available
    }

    /// Ready (not yet delivered) messages in a queue
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn unacked_len(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Enqueue raw headers without encoding them from a `FrameMessage`
    pub fn inject_raw(&self, queue: &str, headers: FrameHeaders, payload: Vec<u8>) {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                headers,
                payload,
                redelivered: false,
            });
        self.shared.notify.notify_waiters();
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>> {
        let mut state = self.shared.lock();
        if !state.available {
            return Err(Error::Transport("broker unavailable".into()));
        }
        let id = state.next_connection;
        state.next_connection += 1;

        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
            generation: state.generation,
            open: true,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    generation: u64,
    open: bool,
}

impl MemoryConnection {
    fn check(&self, state: &BrokerState) -> Result<()> {
        if !self.open {
            return Err(Error::Transport("connection closed".into()));
        }
        if state.generation != self.generation || !state.available {
            return Err(Error::Transport("connection lost".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_queue(&mut self, queue: &str) -> Result<()> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&mut self, queue: &str, message: &FrameMessage) -> Result<()> {
        {
            let mut state = self.shared.lock();
            self.check(&state)?;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::Transport(format!("queue '{}' not declared", queue)))?;
            q.push_back(StoredMessage {
                headers: message.headers(),
                payload: message.payload.clone(),
                redelivered: false,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self, queue: &str) -> Result<Delivery> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                self.check(&state)?;
                let next = state.queues.get_mut(queue).and_then(|q| q.pop_front());
                if let Some(message) = next {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    let delivery = Delivery {
                        tag,
                        headers: message.headers.clone(),
                        payload: message.payload.clone(),
                        redelivered: message.redelivered,
                    };
                    state.unacked.insert(
                        tag,
                        Unacked {
                            connection: self.id,
                            queue: queue.to_string(),
                            message,
                        },
                    );
                    return Ok(delivery);
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        match state.unacked.get(&tag) {
            Some(entry) if entry.connection == self.id => {
                state.unacked.remove(&tag);
                Ok(())
            }
            _ => Err(Error::Transport(format!("unknown delivery tag {}", tag))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let requeued = self.shared.lock().requeue(Some(self.id));
        if requeued > 0 {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        if !self.open {
            return false;
        }
        let state = self.shared.lock();
        state.generation == self.generation && state.available
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            let requeued = self.shared.lock().requeue(Some(self.id));
            if requeued > 0 {
                self.shared.notify.notify_waiters();
            }
        }
    }
}
