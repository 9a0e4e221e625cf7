//! Persistence - Counts, incidents and stream health
//!
//! ## Responsibilities
//!
//! - Store seams (`CountStore`, `IncidentStore`, `HealthStore`) used by the core
//! - MySQL repositories (sqlx) for production
//! - In-memory stores for tests and broker-less runs
//!
//! ## Contracts
//!
//! - Counts: upsert keyed by (stream, date, hour, quarter, class); an update fully
//!   replaces the count, the caller always supplies the complete aggregate
//! - Incidents: insert-only
//! - Stream health: insert on session-up, close the most recent record on session-down

mod count_repository;
mod health_repository;
mod incident_repository;
mod memory;

pub use count_repository::CountRepository;
pub use health_repository::HealthRepository;
pub use incident_repository::IncidentRepository;
pub use memory::{MemoryCountStore, MemoryHealthStore, MemoryIncidentStore};

use crate::bucket_aggregator::BucketKey;
use crate::models::{IncidentClass, VehicleClass};
use crate::track_registry::AggregateCountSet;
use crate::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Composite row key of one class count in one bucket
pub fn source_id(stream_id: &str, key: &BucketKey, class: VehicleClass) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        stream_id,
        key.date.format("%Y-%m-%d"),
        key.hour,
        key.quarter,
        class.as_str()
    )
}

/// Per-bucket vehicle counts
#[async_trait]
pub trait CountStore: Send + Sync {
    /// Write every class of `counts` under `key`, replacing existing values
    async fn upsert_counts(
        &self,
        stream_id: &str,
        key: &BucketKey,
        counts: &AggregateCountSet,
    ) -> Result<()>;

    /// Latest persisted count per class; classes never written are absent
    async fn fetch_counts(
        &self,
        stream_id: &str,
        key: &BucketKey,
    ) -> Result<HashMap<VehicleClass, u32>>;
}

/// Incident record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub incident_id: Uuid,
    pub stream_id: String,
    pub class: IncidentClass,
    pub timestamp: NaiveDateTime,
    pub image_ref: String,
}

/// Insert-only incident log
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn insert_incident(&self, record: &IncidentRecord) -> Result<()>;
}

/// Response codes written to the stream health table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCode {
    /// Session live
    Live,
    /// Stale stream or connection loss
    Lost,
    /// Stopped by operator
    Stopped,
    /// Session ended on a fatal error
    Fatal,
}

impl HealthCode {
    pub fn code(&self) -> i32 {
        match self {
            HealthCode::Live => 200,
            HealthCode::Lost => 503,
            HealthCode::Stopped => 499,
            HealthCode::Fatal => 500,
        }
    }
}

/// Stream health event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub date: NaiveDate,
    pub up_time: NaiveDateTime,
    pub down_time: Option<NaiveDateTime>,
    pub response_code: i32,
}

/// Session up/down history
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Open a new up record, returns its id
    async fn record_up(&self, stream_id: &str, at: NaiveDateTime, code: HealthCode)
        -> Result<Uuid>;

    /// Close the most recent record of the stream; `None` when there is none
    async fn record_down(
        &self,
        stream_id: &str,
        at: NaiveDateTime,
        code: HealthCode,
    ) -> Result<Option<Uuid>>;
}

/// Create tables if absent
pub async fn ensure_schema(pool: &MySqlPool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS vehicle_counts (
            location_id VARCHAR(255) NOT NULL,
            date DATE NOT NULL,
            hour INT NOT NULL,
            quarter INT NOT NULL,
            vehicle_id VARCHAR(32) NOT NULL,
            count INT NOT NULL DEFAULT 0,
            source_id VARCHAR(255) PRIMARY KEY,
            INDEX idx_bucket (location_id, date, hour, quarter)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS stream_quality (
            event_id VARCHAR(36) PRIMARY KEY,
            location_id VARCHAR(255) NOT NULL,
            date DATE NOT NULL,
            up_time DATETIME(6) NULL,
            down_time DATETIME(6) NULL,
            response_code INT NOT NULL,
            INDEX idx_location_up (location_id, up_time)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS incidents (
            incident_id VARCHAR(36) PRIMARY KEY,
            location_id VARCHAR(255) NOT NULL,
            class_label VARCHAR(32) NOT NULL,
            incident_ts DATETIME(6) NOT NULL,
            image_ref VARCHAR(1024) NOT NULL,
            created_at DATETIME(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
            INDEX idx_location_ts (location_id, incident_ts)
        )
        "#,
    ];

    for sql in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| crate::Error::Persistence(e.to_string()))?;
    }

    tracing::info!("Database schema ensured (vehicle_counts, stream_quality, incidents)");
    Ok(())
}
