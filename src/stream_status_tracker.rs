//! Stream Status Tracker
//!
//! Tracks stream connection status changes to detect lost/recovered events.
//! Only transitions are written to the health table.
//!
//! ## Sources
//!
//! Fed from the consumer supervisor's status channel: `Live` is online,
//! stale / recovering is lost, and termination closes the open record with
//! the stop or fatal code.

use crate::persistence::{HealthCode, HealthStore};
use crate::stream_supervisor::{EndReason, SupervisorState, SupervisorStatus};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Stream connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamConnectionStatus {
    /// Initial state (no session seen yet)
    Unknown,
    /// Session live
    Online,
    /// Session stale, recovering or ended
    Offline,
}

/// Stream status transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatusEvent {
    /// First time the stream came up
    Up,
    /// Stream went from Online to Offline
    Lost,
    /// Stream went from Offline to Online
    Recovered,
}

/// Map a supervisor status to (online, code). `None` for in-between states.
pub fn classify(status: &SupervisorStatus) -> Option<(bool, HealthCode)> {
    match status.state {
        SupervisorState::Live => Some((true, HealthCode::Live)),
        SupervisorState::StaleDetected | SupervisorState::Recovering => {
            Some((false, HealthCode::Lost))
        }
        SupervisorState::Terminated => match status.end {
            Some(EndReason::Fatal) => Some((false, HealthCode::Fatal)),
            _ => Some((false, HealthCode::Stopped)),
        },
        SupervisorState::Connecting | SupervisorState::Closing => None,
    }
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Tracks stream connection status and records transitions
pub struct StreamStatusTracker {
    /// Current status of each stream (stream_id -> status)
    statuses: RwLock<HashMap<String, StreamConnectionStatus>>,
    store: Arc<dyn HealthStore>,
}

impl StreamStatusTracker {
    pub fn new(store: Arc<dyn HealthStore>) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Update stream status and return transition event if any
    ///
    /// - `Up` / `Recovered` open a new health record
    /// - `Lost` closes the latest record with `code`
    /// - Unknown -> Offline is reported as `Lost` but has no record to close
    pub async fn update_status(
        &self,
        stream_id: &str,
        is_online: bool,
        code: HealthCode,
    ) -> Option<StreamStatusEvent> {
        let prev = {
            let mut statuses = self.statuses.write().await;
            let new_status = if is_online {
                StreamConnectionStatus::Online
            } else {
                StreamConnectionStatus::Offline
            };
            statuses
                .insert(stream_id.to_string(), new_status)
                .unwrap_or(StreamConnectionStatus::Unknown)
        };

        let event = match (prev, is_online) {
            (StreamConnectionStatus::Unknown, true) => StreamStatusEvent::Up,
            (StreamConnectionStatus::Offline, true) => {
                tracing::info!(stream_id = %stream_id, "Stream connection recovered");
                StreamStatusEvent::Recovered
            }
            (StreamConnectionStatus::Online, false) => {
                tracing::warn!(stream_id = %stream_id, code = code.code(), "Stream connection lost");
                StreamStatusEvent::Lost
            }
            (StreamConnectionStatus::Unknown, false) => {
                tracing::warn!(stream_id = %stream_id, "Stream never came up - marking as lost");
                return Some(StreamStatusEvent::Lost);
            }
            _ => return None,
        };

        let written = match event {
            StreamStatusEvent::Up | StreamStatusEvent::Recovered => self
                .store
                .record_up(stream_id, now(), code)
                .await
                .map(Some),
            StreamStatusEvent::Lost => self.store.record_down(stream_id, now(), code).await,
        };
        match written {
            Ok(Some(event_id)) => {
                tracing::debug!(stream_id = %stream_id, event_id = %event_id, event = ?event, "Health event written");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(stream_id = %stream_id, error = %e, "Failed to write health event");
            }
        }

        Some(event)
    }

    /// Get current status for a stream
    pub async fn get_status(&self, stream_id: &str) -> StreamConnectionStatus {
        self.statuses
            .read()
            .await
            .get(stream_id)
            .copied()
            .unwrap_or(StreamConnectionStatus::Unknown)
    }

    /// Get all offline streams
    pub async fn get_offline_streams(&self) -> Vec<String> {
        self.statuses
            .read()
            .await
            .iter()
            .filter(|(_, status)| **status == StreamConnectionStatus::Offline)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Follow a supervisor until it terminates
    pub async fn watch(&self, stream_id: &str, mut status: watch::Receiver<SupervisorStatus>) {
        loop {
            let current = status.borrow_and_update().clone();
            if let Some((online, code)) = classify(&current) {
                self.update_status(stream_id, online, code).await;
            }
            if current.state == SupervisorState::Terminated {
                return;
            }
            if status.changed().await.is_err() {
                let last = status.borrow().clone();
                if let Some((online, code)) = classify(&last) {
                    self.update_status(stream_id, online, code).await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryHealthStore;

    fn tracker() -> (StreamStatusTracker, Arc<MemoryHealthStore>) {
        let store = Arc::new(MemoryHealthStore::new());
        (StreamStatusTracker::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_initial_online_opens_record() {
        let (tracker, store) = tracker();
        let event = tracker.update_status("cam1", true, HealthCode::Live).await;
        assert_eq!(event, Some(StreamStatusEvent::Up));

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].response_code, 200);
        assert!(events[0].down_time.is_none());
    }

    #[tokio::test]
    async fn test_initial_offline_triggers_lost_without_record() {
        let (tracker, store) = tracker();
        let event = tracker.update_status("cam1", false, HealthCode::Lost).await;
        assert_eq!(event, Some(StreamStatusEvent::Lost));
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_then_recovered() {
        let (tracker, store) = tracker();
        tracker.update_status("cam1", true, HealthCode::Live).await;
        let lost = tracker.update_status("cam1", false, HealthCode::Lost).await;
        assert_eq!(lost, Some(StreamStatusEvent::Lost));
        assert_eq!(tracker.get_offline_streams().await, vec!["cam1".to_string()]);

        let recovered = tracker.update_status("cam1", true, HealthCode::Live).await;
        assert_eq!(recovered, Some(StreamStatusEvent::Recovered));

        let events = store.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].response_code, 503);
        assert!(events[0].down_time.is_some());
        assert!(events[1].down_time.is_none());
    }

    #[tokio::test]
    async fn test_repeated_status_is_silent() {
        let (tracker, store) = tracker();
        tracker.update_status("cam1", true, HealthCode::Live).await;
        assert!(tracker.update_status("cam1", true, HealthCode::Live).await.is_none());
        tracker.update_status("cam1", false, HealthCode::Lost).await;
        assert!(tracker.update_status("cam1", false, HealthCode::Stopped).await.is_none());
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_follows_supervisor_to_fatal_end() {
        let (tracker, store) = tracker();
        let tracker = Arc::new(tracker);
        let (tx, rx) = watch::channel(SupervisorStatus::default());

        let follower = tracker.clone();
        let handle = tokio::spawn(async move { follower.watch("cam9", rx).await });

        tx.send_modify(|s| s.state = SupervisorState::Live);
        while tracker.get_status("cam9").await != StreamConnectionStatus::Online {
            tokio::task::yield_now().await;
        }
        tx.send_modify(|s| {
            s.state = SupervisorState::Terminated;
            s.end = Some(EndReason::Fatal);
        });
        handle.await.unwrap();

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].response_code, 500);
        assert_eq!(tracker.get_status("cam9").await, StreamConnectionStatus::Offline);
    }

    #[test]
    fn test_classify() {
        let mut status = SupervisorStatus::default();
        assert_eq!(classify(&status), None);
        status.state = SupervisorState::Recovering;
        assert_eq!(classify(&status), Some((false, HealthCode::Lost)));
        status.state = SupervisorState::Terminated;
        status.end = Some(EndReason::Stopped);
        assert_eq!(classify(&status), Some((false, HealthCode::Stopped)));
    }
}
