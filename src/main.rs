//! VA Stream - per-camera vehicle counting and incident alerting
//!
//! Main entry point.

use clap::{Parser, Subcommand};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use va_stream_engine::{
    alert_dispatcher::{AlertSink, WebhookAlertSink},
    broker,
    config::{StreamInventory, StreamRole},
    frame_source::FfmpegSourceFactory,
    inference_client::{InferenceClient, InferenceEngine},
    persistence::{
        self, CountRepository, CountStore, HealthRepository, HealthStore, IncidentRepository,
        IncidentStore, MemoryCountStore, MemoryHealthStore, MemoryIncidentStore,
    },
    session_orchestrator::Collaborators,
    state::{AppConfig, AppState},
    stream_manager::{StreamManager, StreamRuntime, StreamStatus},
    stream_status_tracker::StreamStatusTracker,
    stream_supervisor::EndReason,
    web_api,
};

#[derive(Parser)]
#[command(name = "va-stream", version, about = "Per-camera stream analytics engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Control API plus every enabled stream
    Serve {
        /// Keep counts, incidents and health in memory instead of MySQL
        #[arg(long)]
        memory: bool,
        /// Run producers, consumers or both (split roles need BROKER_URL)
        #[arg(long, value_enum, default_value_t = StreamRole::Both)]
        role: StreamRole,
    },
    /// One stream in the foreground until it ends or Ctrl-C.
    /// Exits non-zero when the stream ends on a fatal error.
    Run {
        #[arg(long)]
        stream: String,
        /// Keep counts, incidents and health in memory instead of MySQL
        #[arg(long)]
        memory: bool,
        #[arg(long, value_enum, default_value_t = StreamRole::Both)]
        role: StreamRole,
    },
    /// Validate the stream inventory and exit
    CheckConfig,
}

struct Stores {
    counts: Arc<dyn CountStore>,
    incidents: Arc<dyn IncidentStore>,
    health: Arc<dyn HealthStore>,
}

async fn open_stores(config: &AppConfig, memory: bool) -> anyhow::Result<Stores> {
    if memory {
        tracing::warn!("Using in-memory stores, nothing will be persisted");
        return Ok(Stores {
            counts: Arc::new(MemoryCountStore::new()),
            incidents: Arc::new(MemoryIncidentStore::new()),
            health: Arc::new(MemoryHealthStore::new()),
        });
    }

    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connected");

    persistence::ensure_schema(&pool).await?;

    Ok(Stores {
        counts: Arc::new(CountRepository::new(pool.clone())),
        incidents: Arc::new(IncidentRepository::new(pool.clone())),
        health: Arc::new(HealthRepository::new(pool)),
    })
}

async fn build_manager(
    config: &AppConfig,
    inventory: StreamInventory,
    memory: bool,
    role: StreamRole,
) -> anyhow::Result<(Arc<StreamManager>, Arc<dyn InferenceEngine>)> {
    let broker_url = if memory { None } else { config.broker_url.as_deref() };
    let broker = broker::select_broker(broker_url, config.broker_prefetch, role)?;
    if broker_url.is_none() {
        tracing::warn!("BROKER_URL not set, frames are queued in process memory");
    }

    let stores = open_stores(config, memory).await?;

    let inference: Arc<dyn InferenceEngine> = Arc::new(InferenceClient::new(&config.inference_url)?);
    let alerts: Option<Arc<dyn AlertSink>> = match &config.alert_webhook_url {
        Some(url) => Some(Arc::new(WebhookAlertSink::new(url)?)),
        None => {
            tracing::warn!("ALERT_WEBHOOK_URL not set, incident alerts disabled");
            None
        }
    };

    let runtime = StreamRuntime {
        collaborators: Collaborators {
            inference: inference.clone(),
            counts: stores.counts,
            incidents: stores.incidents,
            alerts,
            incident_save_dir: config.incident_save_dir.clone(),
        },
        broker,
        queue_prefix: config.broker_queue_prefix.clone(),
        sources: Arc::new(FfmpegSourceFactory {
            config: inventory.engine.capture.clone(),
        }),
        health: Arc::new(StreamStatusTracker::new(stores.health)),
        engine: inventory.engine.clone(),
        role,
    };

    Ok((Arc::new(StreamManager::new(runtime, inventory)), inference))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn serve(config: AppConfig, memory: bool, role: StreamRole) -> anyhow::Result<()> {
    let inventory = StreamInventory::load(&config.streams_file).await?;
    let restart_every = inventory.engine.supervisor.fatal_restart();
    let (streams, inference) = build_manager(&config, inventory, memory, role).await?;

    let started = streams.start_enabled().await;
    tracing::info!(started, role = %role, "Enabled streams started");

    let (restarts_stop, restarts_rx) = tokio::sync::watch::channel(false);
    let restarts = tokio::spawn(streams.clone().watch_failed(restart_every, restarts_rx));

    let state = AppState {
        config: config.clone(),
        streams: streams.clone(),
        inference,
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    restarts_stop.send_replace(true);
    if let Err(e) = restarts.await {
        tracing::warn!(error = %e, "Restart watcher panicked");
    }
    streams.stop_all().await;
    Ok(())
}

async fn run_one(
    config: AppConfig,
    stream_id: String,
    memory: bool,
    role: StreamRole,
) -> anyhow::Result<()> {
    let inventory = StreamInventory::load(&config.streams_file).await?;
    let (streams, _) = build_manager(&config, inventory, memory, role).await?;

    streams.start(&stream_id).await?;
    let end = tokio::select! {
        _ = shutdown_signal() => EndReason::Stopped,
        res = streams.wait_terminated(&stream_id) => res?,
    };

    streams.stop_all().await;
    let status = streams.status(&stream_id).await?;
    tracing::info!(
        stream_id = %stream_id,
        session = ?status.session,
        producer = ?status.producer_stats,
        end = ?end,
        "Stream finished"
    );

    finish(&stream_id, end, &status)
}

/// Process result of a foreground stream: a fatal end exits non-zero so a
/// process supervisor restarts us
fn finish(stream_id: &str, end: EndReason, status: &StreamStatus) -> anyhow::Result<()> {
    if end == EndReason::Fatal {
        anyhow::bail!(
            "stream {} ended on a fatal error: {}",
            stream_id,
            status.last_error().unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn check_config(config: AppConfig) -> anyhow::Result<()> {
    let inventory = StreamInventory::load(&config.streams_file).await?;
    for stream in &inventory.streams {
        tracing::info!(
            stream_id = %stream.stream_id,
            uri = %stream.uri,
            services = ?stream.services,
            enabled = stream.enabled,
            "Stream"
        );
    }
    tracing::info!(engine = ?inventory.engine, "Configuration valid");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "va_stream_engine=debug,va_stream=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting VA Stream v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        inference_url = %config.inference_url,
        streams_file = %config.streams_file.display(),
        incident_save_dir = %config.incident_save_dir.display(),
        alerts = config.alert_webhook_url.is_some(),
        amqp = config.broker_url.is_some(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Serve { memory, role } => serve(config, memory, role).await,
        Command::Run {
            stream,
            memory,
            role,
        } => run_one(config, stream, memory, role).await,
        Command::CheckConfig => check_config(config).await,
    }
}
