// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Eye-Fi upload server
//!
//! Answers the SOAP control calls cards make before uploading and receives
//! their UploadPhoto requests.
//!
//! # Features
//!
//! - Control calls on `/api/soap/eyefilm/v1`
//! - Uploads on `/api/soap/eyefilm/v1/upload`, processed on a fixed pool of
//!   blocking workers with a read deadline on every body chunk
//! - Prometheus metrics, JSON status and a health check

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use clap::Parser;
use eyefi_core::{
    config::ServerConfig,
    metrics::Metrics,
    protocol::{ControlRequest, HealthStatus, ServerStatus},
    soap, DirectorySink, SessionService, StaticDirectory, UploadProcessor, MAIN_CONTEXT,
    UPLOAD_CONTEXT,
};
use futures::{Stream, StreamExt};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "eyefi-server")]
#[command(about = "Eye-Fi Server - Receives photos from Eye-Fi wireless SD cards", long_about = None)]
struct Args {
    /// Path to configuration file (ignored if --env-mode is set)
    #[arg(short, long, default_value = "config/server.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Load configuration from environment variables instead of file
    #[arg(long, default_value = "false")]
    env_mode: bool,
}

const XML_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    sessions: Arc<SessionService<StaticDirectory>>,
    uploads: Arc<UploadProcessor<StaticDirectory, DirectorySink>>,
    /// Upload worker pool; one permit per upload being processed
    workers: Arc<Semaphore>,
    worker_count: usize,
    read_timeout: Duration,
    metrics: Metrics,
    started_at: DateTime<Utc>,
}

impl AppState {
    fn new(config: &ServerConfig) -> eyefi_core::Result<Self> {
        config.validate()?;
        let directory = Arc::new(config.directory()?);
        let sink = Arc::new(DirectorySink::new(&config.upload_dir));
        let uploads = UploadProcessor::new(directory.clone(), sink)
            .with_max_logged_part_bytes(config.max_logged_part_bytes);

        Ok(Self {
            sessions: Arc::new(SessionService::new(directory)),
            uploads: Arc::new(uploads),
            workers: Arc::new(Semaphore::new(config.workers)),
            worker_count: config.workers,
            read_timeout: config.read_timeout(),
            metrics: Metrics::new(),
            started_at: Utc::now(),
        })
    }

    fn busy_workers(&self) -> usize {
        self.worker_count
            .saturating_sub(self.workers.available_permits())
    }
}

/// Protocol error rendered as an HTTP status
struct ApiError(eyefi_core::Error);

impl From<eyefi_core::Error> for ApiError {
    fn from(e: eyefi_core::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use eyefi_core::Error;
        let status = match &self.0 {
            Error::Authentication => StatusCode::FORBIDDEN,
            Error::CardNotFound(_) => StatusCode::NOT_FOUND,
            Error::StreamFormat(_) | Error::Protocol(_) | Error::Xml(_) | Error::UnsupportedCharset(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

fn xml_response(xml: String) -> Response {
    (
        StatusCode::OK,
        [(hyper::header::CONTENT_TYPE, XML_CONTENT_TYPE)],
        xml,
    )
        .into_response()
}

/// POST /api/soap/eyefilm/v1 - StartSession, GetPhotoStatus, MarkLastPhotoInRoll
async fn control(State(state): State<AppState>, body: String) -> Result<Response, ApiError> {
    let outcome = soap::parse_envelope(&body)
        .and_then(|msg| ControlRequest::from_soap(&msg))
        .and_then(|request| {
            let response = state.sessions.handle(&request)?;
            match request {
                ControlRequest::StartSession(_) => state.metrics.record_session(),
                ControlRequest::GetPhotoStatus(_) => state.metrics.record_photo_status(),
                ControlRequest::MarkLastPhotoInRoll => {}
            }
            response.to_soap()
        });

    match outcome {
        Ok(xml) => Ok(xml_response(xml)),
        Err(e) => {
            if e.is_auth_error() {
                state.metrics.record_authentication_failure();
            } else {
                state.metrics.record_control_failure();
            }
            warn!("Control call rejected: {}", e);
            Err(e.into())
        }
    }
}

/// Body chunks as an I/O stream, failing with `TimedOut` when a chunk does
/// not arrive within `deadline`
fn with_read_deadline<S>(stream: S, deadline: Duration) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin + Send,
{
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(deadline, stream.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(stream))),
            Ok(Some(Err(e))) => Some((Err(io::Error::new(io::ErrorKind::Other, e)), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(io::Error::new(io::ErrorKind::TimedOut, "upload body read deadline exceeded")),
                None,
            )),
        }
    })
}

/// POST /api/soap/eyefilm/v1/upload - UploadPhoto
async fn upload(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Result<Response, ApiError> {
    let start = Instant::now();
    let content_type = headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| eyefi_core::Error::Protocol("Upload without Content-Type".to_string()))?
        .to_string();

    // Closed only at shutdown
    let permit = state
        .workers
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| eyefi_core::Error::Protocol("Server shutting down".to_string()))?;

    let chunks = with_read_deadline(Box::pin(body.into_data_stream()), state.read_timeout);
    let reader = SyncIoBridge::new(StreamReader::new(Box::pin(chunks)));
    let uploads = state.uploads.clone();

    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        uploads.process_request(&content_type, reader)
    })
    .await
    .map_err(|e| {
        error!("Upload worker failed: {}", e);
        eyefi_core::Error::Sink("Upload worker failed".to_string())
    })?;

    match result {
        Ok(outcome) => {
            state.metrics.record_upload(
                outcome.committed,
                outcome.files,
                outcome.archive_bytes,
                start.elapsed().as_micros() as u64,
            );
            Ok(xml_response(outcome.response().to_soap()?))
        }
        Err(e) => {
            state.metrics.record_upload_failure();
            Err(e.into())
        }
    }
}

/// GET /api/status - System status
async fn get_status(State(state): State<AppState>) -> Json<ServerStatus> {
    let busy = state.busy_workers();
    let mut warnings = Vec::new();
    if busy >= state.worker_count {
        warnings.push("All upload workers busy".to_string());
    }
    let status = if warnings.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(ServerStatus {
        status,
        started_at: state.started_at,
        uptime_seconds: state.metrics.uptime_seconds(),
        cards_registered: state.sessions.directory().len(),
        uploads_in_progress: busy,
        upload_workers: state.worker_count,
        sessions_started: state.metrics.sessions_started(),
        authentication_failures: state.metrics.authentication_failures(),
        uploads_committed: state.metrics.uploads_committed(),
        uploads_aborted: state.metrics.uploads_aborted(),
        uploads_failed: state.metrics.uploads_failed(),
        files_stored: state.metrics.files_stored(),
        bytes_received: state.metrics.bytes_received(),
        warnings,
    })
}

/// GET /health - Simple health check
async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// GET /metrics - Prometheus metrics
async fn get_metrics(State(state): State<AppState>) -> String {
    state.metrics.prometheus_format()
}

fn build_router(state: AppState, request_timeout: Duration) -> Router {
    // Uploads run under the per-chunk read deadline instead
    let control = Router::new()
        .route(MAIN_CONTEXT, post(control))
        .route("/api/status", get(get_status))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route(UPLOAD_CONTEXT, post(upload))
        .merge(control)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args.log_level.parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    info!("SceyeFi Server v{}", eyefi_core::VERSION);

    // Load configuration
    let config = if args.env_mode {
        info!("Loading configuration from environment variables");
        ServerConfig::from_env()
            .context("Failed to load configuration from environment")?
    } else {
        info!("Loading configuration from file: {:?}", args.config);
        ServerConfig::from_file(&args.config)
            .context("Failed to load configuration from file")?
    };

    info!("Listen address: {}", config.listen_address);
    info!("Upload directory: {}", config.upload_dir.display());
    info!("{} card(s), {} upload worker(s)", config.cards.len(), config.workers);

    let state = AppState::new(&config).context("Failed to initialize server state")?;
    let app = build_router(state, config.request_timeout());

    // Parse listen address
    let addr: std::net::SocketAddr = config.listen_address.parse()
        .context("Invalid listen address")?;

    info!("Starting server on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}
