//! Web server for remote preview and control of a calibration session

use anyhow::Result;
use arc_swap::ArcSwapOption;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use rust_embed::RustEmbed;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::signals::SignalHub;
use crate::vision::{Frame, PreviewSink, Progress};

/// Embedded static files for the web UI
#[derive(RustEmbed)]
#[folder = "static/"]
struct StaticAssets;

/// Shared application state
pub struct AppState {
    /// Latest frame per preview window (JPEG encoded)
    previews: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Progress last published by the running session
    progress: ArcSwapOption<Progress>,
    /// Requests forwarded to the session
    pub signals: Arc<SignalHub>,
    jpeg_quality: u8,
}

impl AppState {
    pub fn new(signals: Arc<SignalHub>, jpeg_quality: u8) -> Self {
        Self {
            previews: RwLock::new(BTreeMap::new()),
            progress: ArcSwapOption::empty(),
            signals,
            jpeg_quality,
        }
    }

    /// Update the preview of `window` (called from the session thread)
    pub fn update_preview(&self, window: &str, frame: &Frame) {
        match encode_jpeg(frame, self.jpeg_quality) {
            Ok(jpeg) => {
                self.previews.write().insert(window.to_string(), jpeg);
            }
            Err(e) => warn!("Failed to encode preview for {}: {}", window, e),
        }
    }

    /// Latest preview of `window`, empty when none was published yet
    pub fn get_preview(&self, window: &str) -> Vec<u8> {
        self.previews.read().get(window).cloned().unwrap_or_default()
    }

    pub fn windows(&self) -> Vec<String> {
        self.previews.read().keys().cloned().collect()
    }

    pub fn set_progress(&self, progress: Progress) {
        self.progress.store(Some(Arc::new(progress)));
    }

    pub fn progress(&self) -> Option<Arc<Progress>> {
        self.progress.load_full()
    }
}

/// [`PreviewSink`] publishing to the web server
pub struct RemoteDisplay {
    state: Arc<AppState>,
}

impl RemoteDisplay {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl PreviewSink for RemoteDisplay {
    fn show(&mut self, window: &str, frame: &Frame) {
        self.state.update_preview(window, frame);
    }

    fn report(&mut self, progress: &Progress) {
        debug!("Progress: {:?}", progress);
        self.state.set_progress(progress.clone());
    }
}

/// Encode an RGB frame to JPEG
fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    use image::ImageOutputFormat;
    use std::io::Cursor;

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    frame.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Static files and UI
        .route("/", get(index_handler))
        .route("/static/*path", get(static_handler))
        // Session control
        .route("/api/status", get(get_status))
        .route("/api/capture", post(request_capture))
        .route("/api/abort", post(request_abort))
        // Previews
        .route("/api/preview/:window", get(get_preview))
        .route("/api/preview/:window/stream", get(preview_stream))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve the main index page
async fn index_handler() -> impl IntoResponse {
    match StaticAssets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "Index not found").into_response(),
    }
}

/// Serve static files
async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');

    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(axum::http::header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    mode: Option<&'static str>,
    phase: Option<&'static str>,
    samples: usize,
    target: usize,
    windows: Vec<String>,
    abort_requested: bool,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let progress = state.progress();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: progress.as_ref().map(|p| p.mode),
        phase: progress.as_ref().map(|p| p.phase),
        samples: progress.as_ref().map_or(0, |p| p.samples),
        target: progress.as_ref().map_or(0, |p| p.target),
        windows: state.windows(),
        abort_requested: state.signals.abort_requested(),
    })
}

async fn request_capture(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.signals.request_capture();
    StatusCode::ACCEPTED
}

async fn request_abort(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.signals.request_abort();
    StatusCode::ACCEPTED
}

/// Get the current frame of a preview window (JPEG)
async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path(window): Path<String>,
) -> impl IntoResponse {
    let frame = state.get_preview(&window);
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame,
    )
        .into_response()
}

/// MJPEG stream endpoint for continuous preview
async fn preview_stream(
    State(state): State<Arc<AppState>>,
    Path(window): Path<String>,
) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(100), // ~10 fps for preview
    ))
    .map(move |_| {
        let frame = state.get_preview(&window);
        if frame.is_empty() {
            return Ok::<_, std::convert::Infallible>(
                "--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_string().into_bytes(),
            );
        }

        let mut response = Vec::new();
        response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        response.extend_from_slice(frame.len().to_string().as_bytes());
        response.extend_from_slice(b"\r\n\r\n");
        response.extend_from_slice(&frame);
        response.extend_from_slice(b"\r\n");

        Ok(response)
    });

    let body = Body::from_stream(stream);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
}
