//! Read-only access to what the capture script leaves on disk.
//!
//! Each run writes into a `timelapse_*` folder under the configured output
//! root, with frames in `video_frames/` and the rendered clip in `video/`.
//! Only the newest folder (by modification time) is ever exposed.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use axum::{
    Json,
    body::Body,
    extract::{Path as UrlPath, Request, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::debug;

use crate::infra::{app_state::AppState, errors::AppError};

pub const RUN_FOLDER_PREFIX: &str = "timelapse_";
pub const FRAMES_DIR: &str = "video_frames";
pub const VIDEO_DIR: &str = "video";
pub const THUMBNAIL_LIMIT: usize = 50;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailsResponse {
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoResponse {
    pub video: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Disposition {
    Inline,
    Attachment,
}

/// Newest `timelapse_*` directory directly under `root`.
pub async fn latest_run_folder(root: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(root).await.ok()?;
    let mut latest: Option<(SystemTime, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with(RUN_FOLDER_PREFIX)
        {
            continue;
        }
        let path = entry.path();
        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if latest.as_ref().is_none_or(|(newest, _)| modified > *newest) {
            latest = Some((modified, path));
        }
    }

    latest.map(|(_, path)| path)
}

/// Regular file names in `dir`, sorted by name. Missing directories are
/// treated as empty.
async fn sorted_file_names(dir: &Path) -> Vec<String> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };

    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if let (true, Ok(name)) = (is_file, entry.file_name().into_string()) {
            names.push(name);
        }
    }
    names.sort();
    names
}

fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Plain file names only: no separators, no parent references.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

/// `GET /thumbnails`
pub async fn thumbnails_handler(
    State(state): State<AppState>,
) -> Json<ThumbnailsResponse> {
    let Some(folder) =
        latest_run_folder(&state.config.capture.output_root).await
    else {
        return Json(ThumbnailsResponse { images: Vec::new() });
    };

    let frames: Vec<String> = sorted_file_names(&folder.join(FRAMES_DIR))
        .await
        .into_iter()
        .filter(|name| is_image(name))
        .collect();
    let skip = frames.len().saturating_sub(THUMBNAIL_LIMIT);
    let images = frames
        .into_iter()
        .skip(skip)
        .map(|name| format!("/frames/{name}"))
        .collect();

    Json(ThumbnailsResponse { images })
}

/// `GET /video`
pub async fn video_handler(State(state): State<AppState>) -> Json<VideoResponse> {
    let video = match latest_run_folder(&state.config.capture.output_root).await {
        Some(folder) => sorted_file_names(&folder.join(VIDEO_DIR))
            .await
            .pop()
            .map(|name| format!("/video_file/{name}")),
        None => None,
    };
    Json(VideoResponse { video })
}

/// `GET /frames/{file}`
pub async fn frame_file_handler(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
    request: Request,
) -> Response {
    serve_artifact(&state, FRAMES_DIR, &file, Disposition::Inline, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// `GET /video_file/{file}`
pub async fn video_file_handler(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
    request: Request,
) -> Response {
    serve_artifact(&state, VIDEO_DIR, &file, Disposition::Inline, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// `GET /download_video/{file}`
pub async fn download_video_handler(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
    request: Request,
) -> Response {
    serve_artifact(&state, VIDEO_DIR, &file, Disposition::Attachment, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn serve_artifact(
    state: &AppState,
    subdir: &str,
    file: &str,
    disposition: Disposition,
    request: Request,
) -> Result<Response, AppError> {
    if !is_safe_file_name(file) {
        debug!(file, "rejected artifact name");
        return Err(AppError::not_found("File not found"));
    }

    let folder = latest_run_folder(&state.config.capture.output_root)
        .await
        .ok_or_else(|| AppError::not_found("Folder not found"))?;
    let dir = folder.join(subdir);
    if !tokio::fs::metadata(&dir)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
    {
        return Err(AppError::not_found(format!("{subdir} folder not found")));
    }

    let response = match ServeFile::new(dir.join(file)).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(infallible) => match infallible {},
    };

    let mut response = response.into_response();
    if matches!(disposition, Disposition::Attachment)
        && response.status().is_success()
        && let Ok(value) =
            HeaderValue::from_str(&format!("attachment; filename=\"{file}\""))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
