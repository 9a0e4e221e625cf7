//! Vehicle count repository
//!
//! ## Table
//! - vehicle_counts: one row per (stream, date, hour, quarter, class)

use super::{source_id, CountStore};
use crate::bucket_aggregator::BucketKey;
use crate::models::VehicleClass;
use crate::track_registry::AggregateCountSet;
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::MySqlPool;
use std::collections::HashMap;
use tracing::{debug, warn};

/// MySQL-backed count store
#[derive(Clone)]
pub struct CountRepository {
    pool: MySqlPool,
}

impl CountRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CountStore for CountRepository {
    async fn upsert_counts(
        &self,
        stream_id: &str,
        key: &BucketKey,
        counts: &AggregateCountSet,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        for class in VehicleClass::ALL {
            sqlx::query(
                r#"
                INSERT INTO vehicle_counts
                    (location_id, date, hour, quarter, vehicle_id, count, source_id)
                VALUES
                    (?, ?, ?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE
                    count = VALUES(count)
                "#,
            )
            .bind(stream_id)
            .bind(key.date)
            .bind(key.hour)
            .bind(key.quarter)
            .bind(class.as_str())
            .bind(counts.get(class))
            .bind(source_id(stream_id, key, class))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        debug!(
            stream_id = %stream_id,
            date = %key.date,
            hour = key.hour,
            quarter = key.quarter,
            total = counts.total(),
            "Bucket counts upserted"
        );
        Ok(())
    }

    async fn fetch_counts(
        &self,
        stream_id: &str,
        key: &BucketKey,
    ) -> Result<HashMap<VehicleClass, u32>> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT vehicle_id, count
            FROM vehicle_counts
            WHERE location_id = ? AND date = ? AND hour = ? AND quarter = ?
            "#,
        )
        .bind(stream_id)
        .bind(key.date)
        .bind(key.hour)
        .bind(key.quarter)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut counts = HashMap::new();
        for (label, count) in rows {
            match VehicleClass::from_label(&label) {
                Some(class) => {
                    counts.insert(class, count.max(0) as u32);
                }
                None => {
                    warn!(stream_id = %stream_id, label = %label, "Unknown vehicle label in vehicle_counts");
                }
            }
        }
        Ok(counts)
    }
}
