//! Application state
//!
//! Holds the shared components of the control API

use crate::broker::DEFAULT_PREFETCH;
use crate::inference_client::InferenceEngine;
use crate::stream_manager::StreamManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database URL
    pub database_url: String,
    /// Inference server URL
    pub inference_url: String,
    /// Incident alert webhook (alerts disabled when unset)
    pub alert_webhook_url: Option<String>,
    /// Incident frame capture directory
    pub incident_save_dir: PathBuf,
    /// Stream inventory JSON
    pub streams_file: PathBuf,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// AMQP broker (in-process broker when unset)
    pub broker_url: Option<String>,
    /// Unacked deliveries per consumer
    pub broker_prefetch: u16,
    /// Queue name prefix, queues are `<prefix>.<stream_id>`
    pub broker_queue_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "mysql://root@localhost/va_stream".to_string()),
            inference_url: std::env::var("INFERENCE_URL")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            incident_save_dir: std::env::var("INCIDENT_SAVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/va-stream/incidents")),
            streams_file: std::env::var("STREAMS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("streams.json")),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            host: std::env::var("HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            broker_url: std::env::var("BROKER_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            broker_prefetch: std::env::var("BROKER_PREFETCH")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PREFETCH),
            broker_queue_prefix: std::env::var("BROKER_QUEUE_PREFIX")
                .unwrap_or_else(|_| "va.frames".to_string()),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Per-stream sessions
    pub streams: Arc<StreamManager>,
    /// Inference adapter, probed by /healthz
    pub inference: Arc<dyn InferenceEngine>,
    /// Process start
    pub started_at: Instant,
}
