use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::relay::RelayError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Relay(e) => {
                let (status, code) = match e {
                    RelayError::NoConnection(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "TENANT_NOT_CONNECTED")
                    }
                    RelayError::InvalidPayload => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    RelayError::SendFailed(_) => (StatusCode::BAD_GATEWAY, "SEND_FAILED"),
                    RelayError::Aborted(_) => (StatusCode::BAD_GATEWAY, "REQUEST_ABORTED"),
                    RelayError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "REQUEST_TIMEOUT"),
                };
                (status, code, e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message) = self.parts();

        // Always log the detailed error server-side
        if status.is_server_error() {
            tracing::error!(code = %code, status = %status.as_u16(), message = %self, "API error");
        } else {
            tracing::warn!(code = %code, status = %status.as_u16(), message = %self, "API error");
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
