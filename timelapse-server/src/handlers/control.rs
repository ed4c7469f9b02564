use axum::{
    Form, Json,
    extract::{FromRequest, Query, Request, State},
    http::header::CONTENT_TYPE,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use timelapse_core::RunStatus;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

pub const DEFAULT_INTERVAL: u32 = 5;
pub const DEFAULT_FRAMES: u32 = 10;

const INVALID_NUMBERS: &str = "Invalid numeric values";

/// Body of a successful control call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// A number as sent by a browser form or a JSON client.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Int(i64),
    Text(String),
}

impl RawNumber {
    fn parse(&self) -> Result<u32, AppError> {
        let value = match self {
            RawNumber::Int(value) => *value,
            RawNumber::Text(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| AppError::bad_request(INVALID_NUMBERS))?,
        };
        // Values below one are reported by the supervisor's own validation.
        if value < 1 {
            return Ok(0);
        }
        u32::try_from(value).map_err(|_| AppError::bad_request(INVALID_NUMBERS))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartParams {
    pub interval: Option<RawNumber>,
    pub frames: Option<RawNumber>,
}

impl StartParams {
    /// Fields present in `self` win over `fallback`.
    fn or(self, fallback: StartParams) -> Self {
        Self {
            interval: self.interval.or(fallback.interval),
            frames: self.frames.or(fallback.frames),
        }
    }

    fn resolve(&self) -> Result<(u32, u32), AppError> {
        let interval = match &self.interval {
            Some(raw) => raw.parse()?,
            None => DEFAULT_INTERVAL,
        };
        let frames = match &self.frames {
            Some(raw) => raw.parse()?,
            None => DEFAULT_FRAMES,
        };
        Ok((interval, frames))
    }
}

/// `POST /start`. Parameters come from a JSON body, a form body or the
/// query string, in that order of precedence.
pub async fn start_capture_handler(
    State(state): State<AppState>,
    Query(query): Query<StartParams>,
    request: Request,
) -> AppResult<Json<ActionResponse>> {
    let body = body_params(request, &state).await?;
    let (interval, frames) = body.or(query).resolve()?;

    state.supervisor.start(interval, frames).await?;
    info!(interval, frames, "timelapse started");

    Ok(Json(ActionResponse::ok("Timelapse started")))
}

/// `POST /stop`
pub async fn stop_capture_handler(
    State(state): State<AppState>,
) -> AppResult<Json<ActionResponse>> {
    state.supervisor.stop().await?;
    info!("stop signal sent to timelapse");
    Ok(Json(ActionResponse::ok("Stop signal sent")))
}

/// `GET /status`
pub async fn status_handler(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.supervisor.status())
}

async fn body_params(
    request: Request,
    state: &AppState,
) -> AppResult<StartParams> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();

    if content_type.starts_with("application/json") {
        let Json(params) = Json::<StartParams>::from_request(request, state)
            .await
            .map_err(|_| AppError::bad_request(INVALID_NUMBERS))?;
        Ok(params)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(params) = Form::<StartParams>::from_request(request, state)
            .await
            .map_err(|_| AppError::bad_request(INVALID_NUMBERS))?;
        Ok(params)
    } else {
        Ok(StartParams::default())
    }
}
