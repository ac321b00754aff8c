mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use homecam_capture::{CaptureCoordinator, CaptureStatus, CoordinatorSettings, StreamSource};
use homecam_common::config::Config;
use homecam_monitor::cache::run_cleanup_loop;
use homecam_monitor::notify::{run_dispatcher, LogSink, WebhookSink};
use homecam_monitor::recorder::check_ffmpeg_available;
use homecam_monitor::{
    CaptureError, ClipEncoder, EncodeError, MonitorService, MonitorSettings, MotionDetector,
    OutputFile,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    service: Arc<MonitorService<StreamSource>>,
    default_clip: Duration,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    connected: bool,
    buffered_frames: usize,
    capture_state: &'static str,
}

impl From<CaptureStatus> for StatusResponse {
    fn from(status: CaptureStatus) -> Self {
        Self {
            running: status.running(),
            connected: status.connected(),
            buffered_frames: status.buffered_frames,
            capture_state: status.state.as_str(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClipQuery {
    seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn error_status(e: &CaptureError) -> StatusCode {
    match e {
        CaptureError::NotRunning => StatusCode::CONFLICT,
        CaptureError::BufferEmpty | CaptureError::Encode(EncodeError::NoFrames) => {
            StatusCode::NOT_FOUND
        }
        CaptureError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: CaptureError) -> Response {
    let status = error_status(&e);
    if status.is_server_error() {
        error!(error = %e, "capture request failed");
    } else {
        warn!(error = %e, "capture request rejected");
    }
    (status, e.to_string()).into_response()
}

/// Clip length for a `/clip` request. Zero seconds is a bad request.
fn requested_clip(seconds: Option<u64>, default: Duration) -> Result<Duration, (StatusCode, String)> {
    match seconds {
        None => Ok(default),
        Some(0) => Err((
            StatusCode::BAD_REQUEST,
            "seconds must be greater than 0".to_string(),
        )),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Send the file back; it is removed when `file` drops at the end.
async fn file_response(file: OutputFile, content_type: &'static str) -> Response {
    match tokio::fs::read(file.path()).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(e) => {
            error!(path = %file.path().display(), error = %e, "failed to read output file");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /monitoring/start
async fn start_monitoring(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.service.start_monitoring().await {
        warn!("camera not reachable yet, monitoring keeps retrying");
    }
    Json(StatusResponse::from(state.service.status()))
}

/// POST /monitoring/stop
async fn stop_monitoring(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.service.stop_monitoring().await;
    Json(StatusResponse::from(state.service.status()))
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse::from(state.service.status()))
}

/// GET /snapshot
async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    match state.service.snapshot().await {
        Ok(file) => file_response(file, "image/jpeg").await,
        Err(e) => error_response(e),
    }
}

/// GET /clip?seconds=
async fn clip(State(state): State<Arc<AppState>>, Query(q): Query<ClipQuery>) -> Response {
    let duration = match requested_clip(q.seconds, state.default_clip) {
        Ok(duration) => duration,
        Err(rejection) => {
            warn!(seconds = ?q.seconds, "invalid clip request");
            return rejection.into_response();
        }
    };
    match state.service.request_clip(duration).await {
        Ok(file) => file_response(file, "video/mp4").await,
        Err(e) => error_response(e),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e}");
            std::process::exit(1);
        }
    };

    info!(
        url = config.stream.url,
        mode = ?config.stream.mode,
        fps = config.stream.fps,
        buffer_frames = config.buffer_capacity(),
        output_dir = %config.storage.output_dir.display(),
        "starting homecam"
    );
    check_ffmpeg_available(&config.video.ffmpeg_path).await;

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let capture = Arc::new(CaptureCoordinator::new(
        StreamSource::from_config(&config),
        CoordinatorSettings::from_config(&config),
        events_tx.clone(),
    ));
    let service = Arc::new(MonitorService::new(
        capture,
        MotionDetector::from_config(&config.motion),
        ClipEncoder::from_config(&config),
        events_tx,
        MonitorSettings::from_config(&config),
    ));

    match &config.notification.webhook_url {
        Some(url) => match WebhookSink::new(url, WEBHOOK_TIMEOUT) {
            Ok(sink) => {
                info!(url, "notifications go to webhook");
                tokio::spawn(run_dispatcher(sink, events_rx));
            }
            Err(e) => {
                error!(error = %e, "failed to create webhook client");
                std::process::exit(1);
            }
        },
        None => {
            info!("no webhook configured, notifications go to the log");
            tokio::spawn(run_dispatcher(LogSink, events_rx));
        }
    }

    tokio::spawn(run_cleanup_loop(
        config.storage.output_dir.clone(),
        config.storage.max_size_mb,
        Duration::from_secs(config.storage.cleanup_interval_secs),
    ));

    let state = Arc::new(AppState {
        service: Arc::clone(&service),
        default_clip: Duration::from_secs(config.notification.clip_seconds),
    });

    let app = Router::new()
        .route("/monitoring/start", post(start_monitoring))
        .route("/monitoring/stop", post(stop_monitoring))
        .route("/status", get(status))
        .route("/snapshot", get(snapshot))
        .route("/clip", get(clip))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.control.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    info!(addr, "control server listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "control server failed");
    }

    service.stop_monitoring().await;
    info!("homecam stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use homecam_capture::{CaptureState, ConnectionState};

    #[test]
    fn capture_errors_map_to_http_status() {
        assert_eq!(error_status(&CaptureError::NotRunning), StatusCode::CONFLICT);
        assert_eq!(error_status(&CaptureError::BufferEmpty), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&CaptureError::Encode(EncodeError::NoFrames)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&CaptureError::Encode(EncodeError::FfmpegFailed("boom".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn clip_length_defaults_and_rejects_zero() {
        let default = Duration::from_secs(5);
        assert_eq!(requested_clip(None, default), Ok(default));
        assert_eq!(requested_clip(Some(12), default), Ok(Duration::from_secs(12)));

        let (status, body) = requested_clip(Some(0), default).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("greater than 0"), "{body}");
    }

    #[test]
    fn degraded_status_reports_running_but_disconnected() {
        let body = StatusResponse::from(CaptureStatus {
            state: CaptureState::Running,
            connection: ConnectionState::Connecting,
            buffered_frames: 12,
        });
        assert!(body.running);
        assert!(!body.connected);
        assert_eq!(body.buffered_frames, 12);
        assert_eq!(body.capture_state, "running");
    }
}
