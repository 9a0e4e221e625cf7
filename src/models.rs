//! Shared models and types
//!
//! Value types used by more than one service, kept here
//! to avoid circular dependencies between modules.

use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire format of the `timestamp` frame header (microsecond precision)
pub const FRAME_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Parse a `timestamp` header. The fraction is optional.
pub fn parse_frame_ts(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| Error::Parse(format!("invalid frame timestamp '{}': {}", raw, e)))
}

/// Render a frame timestamp for the `timestamp` header
pub fn format_frame_ts(ts: &NaiveDateTime) -> String {
    ts.format(FRAME_TS_FORMAT).to_string()
}

/// Vehicle class label table. Declaration order is the class index
/// and the majority tie-break order (lowest index wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Auto,
    Bus,
    Car,
    Motorbike,
    Truck,
    Person,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 6] = [
        VehicleClass::Auto,
        VehicleClass::Bus,
        VehicleClass::Car,
        VehicleClass::Motorbike,
        VehicleClass::Truck,
        VehicleClass::Person,
    ];

    /// Map a detector class id to a label
    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(&self) -> u32 {
        *self as u32
    }

    /// Map a stored label back to a class
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == label)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Auto => "auto",
            VehicleClass::Bus => "bus",
            VehicleClass::Car => "car",
            VehicleClass::Motorbike => "motorbike",
            VehicleClass::Truck => "truck",
            VehicleClass::Person => "person",
        }
    }

    /// Whether the class is a vehicle (person is tracked but not a vehicle)
    pub fn is_vehicle(&self) -> bool {
        !matches!(self, VehicleClass::Person)
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident classes, each with its own independent window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentClass {
    Accident,
    Fire,
    Altercation,
}

impl IncidentClass {
    pub const ALL: [IncidentClass; 3] = [
        IncidentClass::Accident,
        IncidentClass::Fire,
        IncidentClass::Altercation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentClass::Accident => "accident",
            IncidentClass::Fire => "fire",
            IncidentClass::Altercation => "altercation",
        }
    }

    /// Human readable name used in alerts
    pub fn display_name(&self) -> &'static str {
        match self {
            IncidentClass::Accident => "Accident",
            IncidentClass::Fire => "Fire",
            IncidentClass::Altercation => "Fight",
        }
    }
}

impl fmt::Display for IncidentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compressed frame as carried by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    /// `timestamp` header, wall clock of the capture
    pub timestamp: NaiveDateTime,
    /// `resume` header, set only on the first message after a producer recovery
    pub resume: bool,
    /// Opaque JPEG payload
    pub payload: Vec<u8>,
}

impl FrameMessage {
    pub fn new(timestamp: NaiveDateTime, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            resume: false,
            payload,
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Header values as they go over the wire
    pub fn headers(&self) -> FrameHeaders {
        FrameHeaders {
            timestamp: format_frame_ts(&self.timestamp),
            resume: if self.resume { Some(true) } else { None },
        }
    }

    /// Rebuild a message from wire headers
    pub fn from_headers(headers: &FrameHeaders, payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            timestamp: parse_frame_ts(&headers.timestamp)?,
            resume: headers.resume.unwrap_or(false),
            payload,
        })
    }
}

/// Wire headers of a frame message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeaders {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub streams_running: usize,
    pub inference_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_ts_with_and_without_fraction() {
        let ts = parse_frame_ts("2024-03-01 10:14:59.999000").unwrap();
        assert_eq!(ts.minute(), 14);
        assert_eq!(ts.nanosecond(), 999_000_000);

        let whole = parse_frame_ts("2024-03-01 10:15:00").unwrap();
        assert_eq!(whole.minute(), 15);
        assert_eq!(whole.nanosecond(), 0);
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        assert!(matches!(parse_frame_ts("yesterday"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_headers_resume_only_when_set() {
        let ts = parse_frame_ts("2024-03-01 10:00:00.000001").unwrap();
        let plain = FrameMessage::new(ts, vec![1, 2]);
        assert_eq!(plain.headers().resume, None);
        assert_eq!(plain.headers().timestamp, "2024-03-01 10:00:00.000001");

        let resumed = plain.with_resume(true);
        let back = FrameMessage::from_headers(&resumed.headers(), vec![1, 2]).unwrap();
        assert!(back.resume);
        assert_eq!(back.timestamp, ts);
    }

    #[test]
    fn test_vehicle_class_index_order() {
        assert_eq!(VehicleClass::from_index(2), Some(VehicleClass::Car));
        assert_eq!(VehicleClass::from_index(6), None);
        assert_eq!(VehicleClass::from_label("motorbike"), Some(VehicleClass::Motorbike));
        assert!(VehicleClass::Car < VehicleClass::Truck);
        assert!(!VehicleClass::Person.is_vehicle());
    }
}
