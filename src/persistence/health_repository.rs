//! Stream health repository
//!
//! ## Table
//! - stream_quality: one row per live period of a stream

use super::{HealthCode, HealthStore};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::MySqlPool;
use tracing::info;
use uuid::Uuid;

/// MySQL-backed health store
#[derive(Clone)]
pub struct HealthRepository {
    pool: MySqlPool,
}

impl HealthRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthStore for HealthRepository {
    async fn record_up(
        &self,
        stream_id: &str,
        at: NaiveDateTime,
        code: HealthCode,
    ) -> Result<Uuid> {
        let event_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO stream_quality
                (event_id, location_id, date, up_time, response_code)
            VALUES
                (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_id.to_string())
        .bind(stream_id)
        .bind(at.date())
        .bind(at)
        .bind(code.code())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        info!(stream_id = %stream_id, event_id = %event_id, up_time = %at, "Inserted new up_time");
        Ok(event_id)
    }

    async fn record_down(
        &self,
        stream_id: &str,
        at: NaiveDateTime,
        code: HealthCode,
    ) -> Result<Option<Uuid>> {
        let latest: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM stream_quality
            WHERE location_id = ?
            ORDER BY up_time DESC
            LIMIT 1
            "#,
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        let Some((event_id,)) = latest else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE stream_quality
            SET down_time = ?, response_code = ?
            WHERE event_id = ?
            "#,
        )
        .bind(at)
        .bind(code.code())
        .bind(&event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        info!(stream_id = %stream_id, event_id = %event_id, down_time = %at, "Updated down_time");

        let parsed = Uuid::parse_str(&event_id)
            .map_err(|e| Error::Parse(format!("stream_quality.event_id '{}': {}", event_id, e)))?;
        Ok(Some(parsed))
    }
}
