//! HTTP error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use keel_channel::ChannelError;
use keel_plugin_host::RegistryError;
use serde::Serialize;

/// Status used when the caller has gone away
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned from handlers as `{"error": message}`
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn cancelled() -> Self {
        let status =
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        Self::new(status, "Request cancelled")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Cancelled => Self::cancelled(),
            RegistryError::Validation(_)
            | RegistryError::InvalidName(_)
            | RegistryError::Load(_)
            | RegistryError::NameMismatch { .. } => Self::bad_request(e.to_string()),
            RegistryError::NoCompatiblePlugin => Self::not_found(e.to_string()),
            RegistryError::ExecutionFailed => Self::internal(e.to_string()),
            RegistryError::Storage(_) | RegistryError::UnloadFailed { .. } | RegistryError::Worker(_) => {
                tracing::error!(error = %e, "Plugin storage failure");
                Self::internal("Plugin storage failure.")
            }
        }
    }
}

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Cancelled => Self::cancelled(),
            ChannelError::Validation(_)
            | ChannelError::InvalidClientKey(_)
            | ChannelError::Base64Decode { .. }
            | ChannelError::InvalidLength { .. } => Self::bad_request(e.to_string()),
            ChannelError::UnsupportedVersion(_) | ChannelError::DecryptionFailed => {
                Self::forbidden(e.to_string())
            }
            ChannelError::KeyConfiguration(_)
            | ChannelError::KeyDerivation
            | ChannelError::EncryptionFailed => {
                tracing::error!(error = %e, "Channel failure");
                Self::internal("Secure channel failure.")
            }
        }
    }
}
