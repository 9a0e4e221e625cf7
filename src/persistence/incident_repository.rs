//! Incident repository
//!
//! ## Table
//! - incidents: insert-only, one row per notification

use super::{IncidentRecord, IncidentStore};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::MySqlPool;

/// MySQL-backed incident store
#[derive(Clone)]
pub struct IncidentRepository {
    pool: MySqlPool,
}

impl IncidentRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IncidentStore for IncidentRepository {
    async fn insert_incident(&self, record: &IncidentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO incidents
                (incident_id, location_id, class_label, incident_ts, image_ref)
            VALUES
                (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.incident_id.to_string())
        .bind(&record.stream_id)
        .bind(record.class.as_str())
        .bind(record.timestamp)
        .bind(&record.image_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        tracing::info!(
            incident_id = %record.incident_id,
            stream_id = %record.stream_id,
            class = %record.class,
            "Incident record inserted"
        );
        Ok(())
    }
}
