use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    AppState,
    handlers::{artifacts, control, stream},
};

/// Every route the server exposes, with request tracing applied.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(control::start_capture_handler))
        .route("/stop", post(control::stop_capture_handler))
        .route("/status", get(control::status_handler))
        .route("/stream/logs", get(stream::log_stream_handler))
        .route("/stream/status", get(stream::status_stream_handler))
        .route("/thumbnails", get(artifacts::thumbnails_handler))
        .route("/frames/{file}", get(artifacts::frame_file_handler))
        .route("/video", get(artifacts::video_handler))
        .route("/video_file/{file}", get(artifacts::video_file_handler))
        .route(
            "/download_video/{file}",
            get(artifacts::download_video_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
