//! In-memory stores
//!
//! Same contracts as the MySQL repositories. Used by tests and by
//! `run --memory` for a database-less dry run.

use super::{HealthCode, HealthEvent, HealthStore, IncidentRecord, IncidentStore};
use super::CountStore;
use crate::bucket_aggregator::BucketKey;
use crate::models::VehicleClass;
use crate::track_registry::AggregateCountSet;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

type CountKey = (String, BucketKey, VehicleClass);

/// Count store keyed exactly like the vehicle_counts table
#[derive(Default)]
pub struct MemoryCountStore {
    rows: RwLock<HashMap<CountKey, u32>>,
    fail_writes: AtomicBool,
    upserts: AtomicUsize,
}

impl MemoryCountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent upserts fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful upsert calls
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub async fn count(&self, stream_id: &str, key: &BucketKey, class: VehicleClass) -> Option<u32> {
        self.rows
            .read()
            .await
            .get(&(stream_id.to_string(), *key, class))
            .copied()
    }

    /// Full persisted set for a bucket; classes never written read as 0
    pub async fn bucket(&self, stream_id: &str, key: &BucketKey) -> AggregateCountSet {
        let rows = self.rows.read().await;
        VehicleClass::ALL
            .iter()
            .map(|class| {
                let count = rows
                    .get(&(stream_id.to_string(), *key, *class))
                    .copied()
                    .unwrap_or(0);
                (*class, count)
            })
            .collect()
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl CountStore for MemoryCountStore {
    async fn upsert_counts(
        &self,
        stream_id: &str,
        key: &BucketKey,
        counts: &AggregateCountSet,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence("count store unavailable".to_string()));
        }

        let mut rows = self.rows.write().await;
        for class in VehicleClass::ALL {
            rows.insert((stream_id.to_string(), *key, class), counts.get(class));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_counts(
        &self,
        stream_id: &str,
        key: &BucketKey,
    ) -> Result<HashMap<VehicleClass, u32>> {
        let rows = self.rows.read().await;
        Ok(VehicleClass::ALL
            .iter()
            .filter_map(|class| {
                rows.get(&(stream_id.to_string(), *key, *class))
                    .map(|count| (*class, *count))
            })
            .collect())
    }
}

/// Insert-only incident log
#[derive(Default)]
pub struct MemoryIncidentStore {
    records: RwLock<Vec<IncidentRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<IncidentRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn insert_incident(&self, record: &IncidentRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence("incident store unavailable".to_string()));
        }
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.incident_id == record.incident_id) {
            return Err(Error::Persistence(format!(
                "duplicate incident_id {}",
                record.incident_id
            )));
        }
        records.push(record.clone());
        Ok(())
    }
}

/// Stream health history
#[derive(Default)]
pub struct MemoryHealthStore {
    events: RwLock<Vec<HealthEvent>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<HealthEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn record_up(
        &self,
        stream_id: &str,
        at: NaiveDateTime,
        code: HealthCode,
    ) -> Result<Uuid> {
        let event = HealthEvent {
            event_id: Uuid::new_v4(),
            stream_id: stream_id.to_string(),
            date: at.date(),
            up_time: at,
            down_time: None,
            response_code: code.code(),
        };
        let id = event.event_id;
        self.events.write().await.push(event);
        Ok(id)
    }

    async fn record_down(
        &self,
        stream_id: &str,
        at: NaiveDateTime,
        code: HealthCode,
    ) -> Result<Option<Uuid>> {
        let mut events = self.events.write().await;
        let latest = events
            .iter_mut()
            .filter(|e| e.stream_id == stream_id)
            .max_by_key(|e| e.up_time);

        Ok(latest.map(|event| {
            event.down_time = Some(at);
            event.response_code = code.code();
            event.event_id
        }))
    }
}
