//! VA Stream Engine Library
//!
//! Per-camera video analytics: vehicle counts in 15-minute buckets and
//! debounced incident alerts, kept alive across transport failures.
//!
//! ## Architecture
//!
//! 1. TrackRegistry - Per-track majority vote and eviction
//! 2. BucketAggregator - Quarter-hour buckets, rollover and resume
//! 3. IncidentWindowDetector - Leaky counters and spike clustering
//! 4. StreamSupervisor - Watchdog and linear-backoff recovery
//! 5. Producer / Consumer - Supervised transports around the broker
//! 6. SessionOrchestrator - Per-stream frame pipeline
//! 7. StreamManager - Per-stream task isolation, start / stop
//! 8. WebAPI - Process control surface
//!
//! ## Design Principles
//!
//! - One stream, one set of tasks: nothing mutable is shared across streams
//! - Frame-embedded timestamps drive business logic; wall-clock time only
//!   drives the watchdog
//! - A frame is acknowledged only after it was fully processed

pub mod alert_dispatcher;
pub mod broker;
pub mod bucket_aggregator;
pub mod config;
pub mod consumer;
pub mod error;
pub mod frame_source;
pub mod incident_detector;
pub mod incident_notifier;
pub mod inference_client;
pub mod models;
pub mod persistence;
pub mod producer;
pub mod session_orchestrator;
pub mod state;
pub mod stream_manager;
pub mod stream_status_tracker;
pub mod stream_supervisor;
pub mod track_registry;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
