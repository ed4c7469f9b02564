use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use timelapse_core::SupervisorError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "message": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<SupervisorError> for AppError {
    fn from(err: SupervisorError) -> Self {
        let message = err.to_string();
        match err {
            SupervisorError::InvalidArgument(_)
            | SupervisorError::AlreadyRunning
            | SupervisorError::NotRunning => Self::bad_request(message),
            SupervisorError::ScriptUnavailable(_) => Self::internal(message),
            SupervisorError::Spawn(source) => {
                tracing::error!(error = %source, "capture script failed to spawn");
                Self::internal(message)
            }
        }
    }
}
