//! BucketAggregator - 15-minute count buckets
//!
//! ## Responsibilities
//!
//! - Map frame timestamps to (date, hour, quarter) bucket keys
//! - Close the open bucket with its final snapshot when a frame crosses a boundary
//! - Persist the open bucket whenever its aggregate changes
//! - Seed the aggregate from storage on session (re)start
//!
//! Bucket keys always come from the frame's embedded timestamp, never from
//! processing time.

use crate::persistence::CountStore;
use crate::track_registry::{AggregateCountSet, TrackRegistry};
use crate::Result;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Bucket identity within one stream. Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub date: NaiveDate,
    pub hour: u32,
    /// 1..=4
    pub quarter: u32,
}

impl BucketKey {
    pub fn from_timestamp(ts: &NaiveDateTime) -> Self {
        Self {
            date: ts.date(),
            hour: ts.hour(),
            quarter: ts.minute() / 15 + 1,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}h Q{}",
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.hour,
            self.quarter
        )
    }
}

/// A bucket that was closed by a rollover
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedBucket {
    pub key: BucketKey,
    pub counts: AggregateCountSet,
}

/// Per-stream bucket bookkeeping
pub struct BucketAggregator {
    stream_id: String,
    store: Arc<dyn CountStore>,
    current: Option<BucketKey>,
    last_persisted: Option<AggregateCountSet>,
}

impl BucketAggregator {
    pub fn new(stream_id: impl Into<String>, store: Arc<dyn CountStore>) -> Self {
        Self {
            stream_id: stream_id.into(),
            store,
            current: None,
            last_persisted: None,
        }
    }

    pub fn bucket_key(ts: &NaiveDateTime) -> BucketKey {
        BucketKey::from_timestamp(ts)
    }

    /// Open bucket, if any
    pub fn current(&self) -> Option<BucketKey> {
        self.current
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Seed the open bucket from storage and write the seed straight back.
    ///
    /// Classes with no stored row start at 0. Returns the seeded aggregate,
    /// which the caller installs into a fresh `TrackRegistry`.
    pub async fn resume(&mut self, ts: &NaiveDateTime) -> Result<AggregateCountSet> {
        let key = Self::bucket_key(ts);
        let stored = self.store.fetch_counts(&self.stream_id, &key).await?;

        let seeded: AggregateCountSet = crate::models::VehicleClass::ALL
            .iter()
            .map(|class| (*class, stored.get(class).copied().unwrap_or(0)))
            .collect();

        self.store
            .upsert_counts(&self.stream_id, &key, &seeded)
            .await?;

        info!(
            stream_id = %self.stream_id,
            bucket = %key,
            total = seeded.total(),
            "Resumed bucket from storage"
        );

        self.current = Some(key);
        self.last_persisted = Some(seeded.clone());
        Ok(seeded)
    }

    /// Roll the bucket over if `ts` falls in a later bucket than the open one.
    ///
    /// Must run before the frame's detections are applied so the registry
    /// snapshot still belongs to the previous bucket. On rollover the previous
    /// bucket's final snapshot is persisted under its own key, then the
    /// registry aggregate is zeroed. Track state is untouched.
    ///
    /// Frames from an earlier bucket (redelivery) are counted in the open one.
    pub async fn on_frame(
        &mut self,
        ts: &NaiveDateTime,
        registry: &mut TrackRegistry,
    ) -> Result<Option<ClosedBucket>> {
        let key = Self::bucket_key(ts);

        let Some(current) = self.current else {
            self.current = Some(key);
            return Ok(None);
        };

        if key < current {
            debug!(
                stream_id = %self.stream_id,
                frame_bucket = %key,
                open_bucket = %current,
                "Frame older than open bucket, counting in open bucket"
            );
            return Ok(None);
        }
        if key == current {
            return Ok(None);
        }

        let final_counts = registry.snapshot();
        self.store
            .upsert_counts(&self.stream_id, &current, &final_counts)
            .await?;

        info!(
            stream_id = %self.stream_id,
            closed = %current,
            opened = %key,
            summary = ?final_counts.vehicle_summary(),
            "Bucket rollover"
        );

        registry.reset_aggregate();
        self.current = Some(key);
        self.last_persisted = None;

        Ok(Some(ClosedBucket {
            key: current,
            counts: final_counts,
        }))
    }

    /// Persist the open bucket when `snapshot` differs from what was last written
    pub async fn commit(&mut self, snapshot: &AggregateCountSet) -> Result<bool> {
        let Some(key) = self.current else {
            return Ok(false);
        };
        if self.last_persisted.as_ref() == Some(snapshot) {
            return Ok(false);
        }

        self.store
            .upsert_counts(&self.stream_id, &key, snapshot)
            .await?;
        self.last_persisted = Some(snapshot.clone());
        Ok(true)
    }
}
